//! Size-bucket padding for DATA payloads

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use thiserror::Error;

/// Standard padded sizes, smallest first
pub const PAD_SIZES: [usize; 4] = [4096, 8192, 16384, 32768];

/// Length prefix in front of the real data
const LEN_PREFIX: usize = 2;

#[derive(Debug, Error)]
pub enum PaddingError {
    #[error("Payload too large to pad: {0} bytes")]
    TooLarge(usize),

    #[error("Malformed padded payload: {0}")]
    Malformed(&'static str),
}

/// Padding configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingConfig {
    /// Bucket sizes; a payload grows to the first bucket it fits in
    pub sizes: Vec<usize>,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            sizes: PAD_SIZES.to_vec(),
        }
    }
}

impl PaddingConfig {
    /// Padded size for `data_len` bytes of payload
    ///
    /// Payloads bigger than the largest bucket only get the length prefix.
    pub fn target_size(&self, data_len: usize) -> usize {
        let needed = data_len + LEN_PREFIX;
        self.sizes
            .iter()
            .copied()
            .find(|&size| needed <= size)
            .unwrap_or(needed)
    }

    /// Random bytes appended after `data_len` bytes of payload
    pub fn calculate_padding(&self, data_len: usize) -> usize {
        self.target_size(data_len) - data_len - LEN_PREFIX
    }

    /// `len(u16 BE) ‖ data ‖ random padding`
    pub fn pad(&self, data: &[u8]) -> Result<Bytes, PaddingError> {
        let len = u16::try_from(data.len()).map_err(|_| PaddingError::TooLarge(data.len()))?;
        let padding = self.calculate_padding(data.len());

        let mut out = BytesMut::with_capacity(LEN_PREFIX + data.len() + padding);
        out.put_u16(len);
        out.extend_from_slice(data);

        let start = out.len();
        out.resize(start + padding, 0);
        rand::thread_rng().fill_bytes(&mut out[start..]);

        Ok(out.freeze())
    }
}

/// Strip the padding added by [`PaddingConfig::pad`]
pub fn unpad(padded: &Bytes) -> Result<Bytes, PaddingError> {
    if padded.len() < LEN_PREFIX {
        return Err(PaddingError::Malformed("missing length prefix"));
    }

    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if LEN_PREFIX + len > padded.len() {
        return Err(PaddingError::Malformed("length exceeds payload"));
    }
    Ok(padded.slice(LEN_PREFIX..LEN_PREFIX + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_sizes() {
        let config = PaddingConfig::default();

        assert_eq!(config.target_size(0), 4096);
        assert_eq!(config.target_size(4094), 4096);
        assert_eq!(config.target_size(4095), 8192);
        assert_eq!(config.target_size(20_000), 32768);
        assert_eq!(config.target_size(32766), 32768);
        // Past the largest bucket only the prefix is added
        assert_eq!(config.target_size(32768), 32770);
        assert_eq!(config.calculate_padding(32768), 0);
    }

    #[test]
    fn test_pad_and_unpad() {
        let config = PaddingConfig::default();

        let padded = config.pad(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(padded.len(), 4096);
        assert_eq!(&padded[..2], &[0, 18]);
        assert_eq!(&unpad(&padded).unwrap()[..], b"GET / HTTP/1.0\r\n\r\n");

        let big = vec![7u8; 10_000];
        let padded = config.pad(&big).unwrap();
        assert_eq!(padded.len(), 16384);
        assert_eq!(unpad(&padded).unwrap(), big);
    }

    #[test]
    fn test_padding_is_random() {
        let config = PaddingConfig::default();
        let a = config.pad(b"x").unwrap();
        let b = config.pad(b"x").unwrap();
        assert_ne!(a[3..], b[3..]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(unpad(&Bytes::from_static(&[0])), Err(PaddingError::Malformed(_))));
        assert!(matches!(
            unpad(&Bytes::from_static(&[0, 9, 1, 2])),
            Err(PaddingError::Malformed(_))
        ));
        assert!(matches!(
            PaddingConfig::default().pad(&vec![0u8; 70_000]),
            Err(PaddingError::TooLarge(70_000))
        ));
    }
}
