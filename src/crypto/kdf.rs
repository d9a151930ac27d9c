//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for deriving payload keys from a user's secret

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Fill `output` with key material bound to `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))
    }

    /// Derive two consecutive 32-byte keys from one expansion
    pub fn expand_pair(&self, info: &[u8]) -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), CryptoError> {
        let mut okm = [0u8; KEY_LEN * 2];
        self.expand(info, &mut okm)?;

        let mut first = [0u8; KEY_LEN];
        let mut second = [0u8; KEY_LEN];
        first.copy_from_slice(&okm[..KEY_LEN]);
        second.copy_from_slice(&okm[KEY_LEN..]);
        Ok((first, second))
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}
