//! X25519 key agreement.
//!
//! Public keys travel base64-encoded inside handshake frames. The raw DH
//! output is never used directly; it is expanded with HKDF-SHA256 so both
//! sides hold the same 32-byte secret.

use super::{constant_time_eq, hkdf_derive};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of X25519 keys in bytes.
pub const X25519_KEY_SIZE: usize = 32;

/// HKDF info string binding derived secrets to this protocol.
const HANDSHAKE_INFO: &[u8] = b"peerlink handshake v1";

/// An X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct X25519PublicKey([u8; X25519_KEY_SIZE]);

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    /// Base64 text carried in handshake frames.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Decode handshake frame text.
    pub fn from_base64(text: &str) -> Result<Self> {
        let raw = BASE64
            .decode(text.trim())
            .map_err(|e| Error::HandshakeDecode(format!("invalid base64: {}", e)))?;
        let bytes: [u8; X25519_KEY_SIZE] = raw.try_into().map_err(|raw: Vec<u8>| {
            Error::HandshakeDecode(format!("expected {} key bytes, got {}", X25519_KEY_SIZE, raw.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only show first 8 bytes in debug output
        write!(f, "X25519PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// Derived per-peer secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; X25519_KEY_SIZE]);

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SharedSecret {}

impl SharedSecret {
    /// Wrap stored secret bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// A local X25519 keypair. The secret is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct StaticKeypair {
    // StaticSecret wipes itself on drop.
    #[zeroize(skip)]
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Export secret key bytes for storage.
    pub fn secret_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Agree on a secret with `their_public`.
    ///
    /// Fails on a low-order remote key, which would yield an all-zero DH
    /// output.
    pub fn agree(&self, their_public: &X25519PublicKey) -> Result<SharedSecret> {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(*their_public.as_bytes()));
        if !shared.was_contributory() {
            return Err(Error::HandshakeDecode("low-order public key".into()));
        }
        let okm = hkdf_derive(None, shared.as_bytes(), HANDSHAKE_INFO, X25519_KEY_SIZE)?;
        let mut bytes = [0u8; X25519_KEY_SIZE];
        bytes.copy_from_slice(&okm);
        Ok(SharedSecret(bytes))
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let a = alice.agree(bob.public_key()).unwrap();
        let b = bob.agree(alice.public_key()).unwrap();
        assert_eq!(a, b);

        // Deterministic for the same pair.
        assert_eq!(alice.agree(bob.public_key()).unwrap(), a);
    }

    #[test]
    fn test_keypair_persistence() {
        let original = StaticKeypair::generate();
        let restored = StaticKeypair::from_secret_bytes(original.secret_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_base64_round_trip_and_errors() {
        let kp = StaticKeypair::generate();
        let text = kp.public_key().to_base64();
        assert_eq!(&X25519PublicKey::from_base64(&text).unwrap(), kp.public_key());

        assert!(matches!(
            X25519PublicKey::from_base64("not base64!!"),
            Err(Error::HandshakeDecode(_))
        ));
        assert!(matches!(
            X25519PublicKey::from_base64("QUJD"),
            Err(Error::HandshakeDecode(_))
        ));
    }

    #[test]
    fn test_low_order_key_rejected() {
        let kp = StaticKeypair::generate();
        let zero = X25519PublicKey::from_bytes([0u8; X25519_KEY_SIZE]);
        assert!(kp.agree(&zero).is_err());
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SharedSecret::from_bytes([9u8; 32]);
        assert_eq!(format!("{:?}", secret), "SharedSecret([REDACTED])");
    }
}
