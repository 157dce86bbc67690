//! # peerlink core library
//!
//! Text messaging between two endpoints over an onion-routed transport,
//! with no central server. The transport may take minutes to bootstrap,
//! drop mid-session or vanish for hours; messages still get through once
//! both sides are reachable again.
//!
//! ## Guarantees
//!
//! - Outgoing messages are durable before any delivery attempt
//! - At-least-once delivery, FIFO per peer on a best-effort basis
//! - Exactly two handshake frames per peer pair, sent by a deterministic
//!   initiator
//! - Nothing is fatal to the process: failures are status values
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          messaging (PeerNode)           │
//! ├──────────────┬──────────────────────────┤
//! │  handshake   │   storage (outbox, db)   │
//! ├──────────────┴──────────────────────────┤
//! │     link (PeerLink, LinkSupervisor)     │
//! ├─────────────────────────────────────────┤
//! │   tor (TransportBootstrap, SOCKS5)      │
//! ├─────────────────────────────────────────┤
//! │          crypto    │    config          │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod link;
pub mod logging;
pub mod messaging;
pub mod storage;
pub mod tor;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
