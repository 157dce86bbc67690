//! Text frames exchanged over a link.
//!
//! ```text
//! ECDH_PUBLIC_KEY:<base64 public key>   handshake
//! FROM:<sender> <body>                  payload
//! ```
//!
//! A frame is a handshake iff it starts with the handshake prefix. A payload
//! body is opaque, even when it happens to look like a key. Anything else is [`Frame::Unknown`] and gets logged and dropped by the
//! caller.

use std::fmt;

/// Prefix of a handshake frame.
pub const HANDSHAKE_PREFIX: &str = "ECDH_PUBLIC_KEY:";

/// Prefix of a payload frame.
pub const PAYLOAD_PREFIX: &str = "FROM:";

/// One classified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Carries one side's public key.
    Handshake {
        /// Encoded public key.
        public_key: String,
    },
    /// Carries a user message attributed to its sender.
    Payload {
        /// Sender rendezvous address.
        sender: String,
        /// Message text.
        body: String,
    },
    /// Unrecognized frame text.
    Unknown(String),
}

impl Frame {
    /// Unattributed handshake frame.
    pub fn handshake(public_key: impl Into<String>) -> Self {
        Frame::Handshake {
            public_key: public_key.into(),
        }
    }

    /// Payload frame.
    pub fn payload(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Frame::Payload {
            sender: sender.into(),
            body: body.into(),
        }
    }

    /// Classify raw frame text.
    pub fn parse(text: &str) -> Self {
        if let Some(key) = text.strip_prefix(HANDSHAKE_PREFIX) {
            return Frame::Handshake {
                public_key: key.trim().to_string(),
            };
        }

        if let Some(rest) = text.strip_prefix(PAYLOAD_PREFIX) {
            if let Some((sender, body)) = rest.split_once(' ') {
                if !sender.is_empty() {
                    return Frame::Payload {
                        sender: sender.to_string(),
                        body: body.to_string(),
                    };
                }
            }
        }

        Frame::Unknown(text.to_string())
    }

    /// Wire text.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Handshake { public_key } => write!(f, "{}{}", HANDSHAKE_PREFIX, public_key),
            Frame::Payload { sender, body } => {
                write!(f, "{}{} {}", PAYLOAD_PREFIX, sender, body)
            }
            Frame::Unknown(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake() {
        assert_eq!(
            Frame::parse("ECDH_PUBLIC_KEY:AAAA"),
            Frame::handshake("AAAA")
        );
    }

    #[test]
    fn test_parse_payload_splits_on_first_space() {
        assert_eq!(
            Frame::parse("FROM:a.onion hello there"),
            Frame::payload("a.onion", "hello there")
        );
        assert_eq!(Frame::parse("FROM:a.onion "), Frame::payload("a.onion", ""));
    }

    #[test]
    fn test_payload_that_looks_like_a_key() {
        // Only the leading prefix makes a handshake; message text is never
        // reinterpreted.
        let key = "ECDH_PUBLIC_KEY:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        let frame = Frame::parse(&format!("FROM:a.onion {}", key));
        assert_eq!(frame, Frame::payload("a.onion", key));
        assert_eq!(frame.encode(), format!("FROM:a.onion {}", key));
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(Frame::parse("hello"), Frame::Unknown(_)));
        assert!(matches!(Frame::parse("FROM:nospace"), Frame::Unknown(_)));
        assert!(matches!(Frame::parse("FROM: body"), Frame::Unknown(_)));
        assert!(matches!(Frame::parse(""), Frame::Unknown(_)));
    }

    #[test]
    fn test_handshake_prefix_wins() {
        // A handshake prefix is checked before the payload prefix.
        assert_eq!(
            Frame::parse("ECDH_PUBLIC_KEY:FROM:x y"),
            Frame::handshake("FROM:x y")
        );
    }

    #[test]
    fn test_encode() {
        assert_eq!(Frame::payload("a.onion", "hello").encode(), "FROM:a.onion hello");
        assert_eq!(Frame::handshake("KEY").encode(), "ECDH_PUBLIC_KEY:KEY");
        assert_eq!(Frame::Unknown("raw".into()).encode(), "raw");
    }
}
