//! Cryptographic primitives
//!
//! This module provides:
//! - HMAC-SHA256 auth tokens bound to a timestamp
//! - ChaCha20-Poly1305 payload sealing for the optional encryption mode
//! - HKDF-SHA256 key derivation
//! - Secure random number generation

mod aead;
mod auth;
mod kdf;

pub use aead::{PayloadCipher, SessionKeys};
pub use auth::{AuthError, AuthToken, Secret};
pub use kdf::Hkdf;

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Replayed or reordered nonce: {0}")]
    Replay(u64),

    #[error("Random number generation failed")]
    Rng,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }
}
