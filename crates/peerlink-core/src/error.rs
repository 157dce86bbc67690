//! Error types for peerlink.
//!
//! Nothing in the core is fatal to the process. Most failures surface as
//! data (transport status, link state, `sent = false`); these variants are
//! what fallible operations return when a caller does need to react.

use thiserror::Error;

/// Core error type for peerlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport process failed to start or never became reachable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Dial failure or stream read/write failure on a peer link.
    #[error("link error: {0}")]
    Link(String),

    /// Malformed key material in a handshake frame.
    #[error("malformed handshake key")]
    HandshakeDecode(String),

    /// A peer presented a key that differs from the one a completed
    /// handshake agreed on.
    #[error("handshake key conflict")]
    HandshakeConflict(String),

    /// Stored handshake state could not be decoded.
    #[error("corrupted handshake state")]
    PersistenceDecode(String),

    /// A frame could not be handed to a connected link.
    #[error("not delivered: {0}")]
    Delivery(String),

    /// Storage operation failed.
    #[error("storage error")]
    Storage(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cryptographic operation failed.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// The transport is not ready for the requested operation.
    #[error("transport not ready")]
    NotReady,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type alias using peerlink's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the offending input should be dropped without tearing down
    /// the link it arrived on.
    pub fn should_drop_frame(&self) -> bool {
        matches!(
            self,
            Error::HandshakeDecode(_) | Error::HandshakeConflict(_) | Error::Encoding(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Link(e.to_string())
    }
}
