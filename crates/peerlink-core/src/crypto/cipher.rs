//! Pluggable payload encryption.
//!
//! Payloads go out in clear by default. [`ChaChaCipher`] is available for
//! callers that want authenticated encryption keyed by the handshake secret;
//! its output is base64 text so it fits in a payload frame.

use super::keys::SharedSecret;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

/// Size of nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Associated data binding ciphertexts to payload frames.
const PAYLOAD_AAD: &[u8] = b"peerlink payload";

/// Transforms payload bytes before they are queued and after they arrive.
pub trait PayloadCipher: Send + Sync {
    /// Encrypt outgoing payload bytes.
    fn encrypt(&self, plaintext: &[u8], secret: Option<&SharedSecret>) -> Result<Vec<u8>>;

    /// Decrypt incoming payload bytes.
    fn decrypt(&self, ciphertext: &[u8], secret: Option<&SharedSecret>) -> Result<Vec<u8>>;

    /// Whether a completed handshake is needed before sending.
    fn requires_secret(&self) -> bool;
}

/// Identity cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl PayloadCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8], _secret: Option<&SharedSecret>) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _secret: Option<&SharedSecret>) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn requires_secret(&self) -> bool {
        false
    }
}

/// ChaCha20-Poly1305 with a random nonce prepended.
///
/// Output format: `base64(nonce (12 bytes) || ciphertext || tag (16 bytes))`
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaCipher;

impl ChaChaCipher {
    fn key(secret: Option<&SharedSecret>) -> Result<&SharedSecret> {
        secret.ok_or_else(|| Error::Crypto("no shared secret for peer".into()))
    }
}

impl PayloadCipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8], secret: Option<&SharedSecret>) -> Result<Vec<u8>> {
        let secret = Self::key(secret)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: PAYLOAD_AAD,
                },
            )
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(output).into_bytes())
    }

    fn decrypt(&self, ciphertext: &[u8], secret: Option<&SharedSecret>) -> Result<Vec<u8>> {
        let secret = Self::key(secret)?;
        let data = BASE64
            .decode(ciphertext)
            .map_err(|e| Error::Crypto(format!("invalid ciphertext encoding: {}", e)))?;

        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto("ciphertext too short".into()));
        }

        let (nonce, body) = data.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(secret.as_bytes()));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: PAYLOAD_AAD,
                },
            )
            .map_err(|_| Error::Crypto("decryption failed".into()))
    }

    fn requires_secret(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> SharedSecret {
        SharedSecret::from_bytes([byte; 32])
    }

    #[test]
    fn test_plaintext_is_identity() {
        let cipher = PlaintextCipher;
        assert_eq!(cipher.encrypt(b"hello", None).unwrap(), b"hello");
        assert_eq!(cipher.decrypt(b"hello", None).unwrap(), b"hello");
        assert!(!cipher.requires_secret());
    }

    #[test]
    fn test_chacha_encrypt_decrypt() {
        let cipher = ChaChaCipher;
        let key = secret(42);
        let sealed = cipher.encrypt(b"Hello, peer!", Some(&key)).unwrap();
        assert!(std::str::from_utf8(&sealed).is_ok());
        assert_ne!(sealed, b"Hello, peer!");

        let opened = cipher.decrypt(&sealed, Some(&key)).unwrap();
        assert_eq!(opened, b"Hello, peer!");
    }

    #[test]
    fn test_chacha_wrong_key_fails() {
        let cipher = ChaChaCipher;
        let sealed = cipher.encrypt(b"secret", Some(&secret(1))).unwrap();
        assert!(cipher.decrypt(&sealed, Some(&secret(2))).is_err());
    }

    #[test]
    fn test_chacha_requires_secret() {
        let cipher = ChaChaCipher;
        assert!(cipher.requires_secret());
        assert!(matches!(cipher.encrypt(b"x", None), Err(Error::Crypto(_))));
        assert!(cipher.decrypt(b"QUJD", Some(&secret(1))).is_err());
    }
}
