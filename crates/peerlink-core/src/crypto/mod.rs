//! Cryptographic primitives.
//!
//! - **X25519**: key agreement for the handshake
//! - **HKDF-SHA256**: expansion of the DH output into the shared secret
//! - **ChaCha20-Poly1305**: optional payload encryption
//!
//! Secret material is zeroized on drop and never logged.

mod cipher;
mod keys;

pub use cipher::{ChaChaCipher, PayloadCipher, PlaintextCipher, NONCE_SIZE, TAG_SIZE};
pub use keys::{SharedSecret, StaticKeypair, X25519PublicKey, X25519_KEY_SIZE};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Derive keys using HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Constant-time comparison of byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_derive() {
        let ikm = b"input key material";
        let info = b"peerlink test";

        let out1 = hkdf_derive(None, ikm, info, 32).unwrap();
        assert_eq!(out1.len(), 32);

        let out2 = hkdf_derive(None, ikm, info, 32).unwrap();
        assert_eq!(&*out1, &*out2);

        let out3 = hkdf_derive(None, ikm, b"different", 32).unwrap();
        assert_ne!(&*out1, &*out3);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hi"));
    }
}
