//! Length-prefixed random padding
//!
//! Wire format: `[original_len: u32 BE][data][random padding]`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::ObfuscationError;

/// Target packet sizes mimicking real API traffic
const SIZE_DISTRIBUTION: &[usize] = &[512, 1024, 2048, 4096, 8192, 16384];

/// Maximum jitter percentage (±10%)
const JITTER_PERCENT: usize = 10;

/// Length prefix size
pub const PADDING_HEADER_LEN: usize = 4;

/// Largest length prefix taken at face value on the read path
pub const MAX_PADDED_FRAME: usize = 16 * 1024 * 1024;

/// How the padding length is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Uniform random length in `[min_size, max_size]`
    #[default]
    Range,
    /// Pad up to the next bucket of a realistic size distribution
    Buckets,
}

/// Padding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingConfig {
    pub enabled: bool,
    pub mode: PaddingMode,
    /// Minimum padding bytes (range mode)
    pub min_size: usize,
    /// Maximum padding bytes (range mode)
    pub max_size: usize,
    /// ±10% jitter on the bucket target (bucket mode)
    pub jitter: bool,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: PaddingMode::Range,
            min_size: 16,
            max_size: 256,
            jitter: true,
        }
    }
}

impl PaddingConfig {
    pub fn validate(&self) -> Result<(), ObfuscationError> {
        if self.min_size > self.max_size {
            return Err(ObfuscationError::InvalidRange {
                what: "padding",
                min: self.min_size as u64,
                max: self.max_size as u64,
            });
        }
        Ok(())
    }
}

/// Padding strategy
#[derive(Debug, Clone)]
pub struct PaddingStrategy {
    mode: PaddingMode,
    min_size: usize,
    max_size: usize,
    jitter: bool,
}

impl Default for PaddingStrategy {
    fn default() -> Self {
        Self {
            mode: PaddingMode::Range,
            min_size: 16,
            max_size: 256,
            jitter: true,
        }
    }
}

impl PaddingStrategy {
    pub fn new(config: &PaddingConfig) -> Result<Self, ObfuscationError> {
        config.validate()?;
        Ok(Self {
            mode: config.mode,
            min_size: config.min_size,
            max_size: config.max_size,
            jitter: config.jitter,
        })
    }

    /// Random padding length in `[min, max]`
    pub fn range(min_size: usize, max_size: usize) -> Result<Self, ObfuscationError> {
        Self::new(&PaddingConfig {
            enabled: true,
            mode: PaddingMode::Range,
            min_size,
            max_size,
            jitter: false,
        })
    }

    /// Bucket mode
    pub fn buckets(jitter: bool) -> Self {
        Self {
            mode: PaddingMode::Buckets,
            jitter,
            ..Self::default()
        }
    }

    /// Bucket target size for a payload of `payload_len` bytes
    pub fn calculate_target_size(&self, payload_len: usize) -> usize {
        let base_target = SIZE_DISTRIBUTION
            .iter()
            .copied()
            .find(|size| *size > payload_len)
            .unwrap_or(16384);

        if self.jitter {
            let jitter_range = base_target / JITTER_PERCENT;
            let jitter = fastrand::usize(0..=jitter_range * 2);
            base_target.saturating_sub(jitter_range) + jitter
        } else {
            base_target
        }
    }

    /// How much padding to add
    pub fn calculate_padding_len(&self, payload_len: usize) -> usize {
        match self.mode {
            PaddingMode::Range => {
                if self.max_size > self.min_size {
                    fastrand::usize(self.min_size..=self.max_size)
                } else {
                    self.min_size
                }
            }
            PaddingMode::Buckets => {
                let framed = payload_len + PADDING_HEADER_LEN;
                self.calculate_target_size(framed).saturating_sub(framed)
            }
        }
    }

    /// Prefix the length and append random bytes
    pub fn pad(&self, data: &[u8]) -> Vec<u8> {
        let Ok(original_len) = u32::try_from(data.len()) else {
            return data.to_vec();
        };

        let padding_len = self.calculate_padding_len(data.len());
        let mut result = Vec::with_capacity(PADDING_HEADER_LEN + data.len() + padding_len);

        result.extend_from_slice(&original_len.to_be_bytes());
        result.extend_from_slice(data);
        // Random padding (not zeros to avoid patterns)
        result.extend((0..padding_len).map(|_| fastrand::u8(..)));

        result
    }

    /// Strict removal: `None` when the prefix is missing or claims more bytes than present
    pub fn unpad(data: &[u8]) -> Option<&[u8]> {
        if data.len() < PADDING_HEADER_LEN {
            return None;
        }

        let original_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if original_len > data.len() - PADDING_HEADER_LEN {
            return None;
        }

        Some(&data[PADDING_HEADER_LEN..PADDING_HEADER_LEN + original_len])
    }

}

/// Incremental padding removal over one connection's reads
///
/// A frame body may span any number of reads. The padding length is not on
/// the wire, so the padding is taken to end with the read that completes the
/// body. A read too short for a prefix, or a prefix over [`MAX_PADDED_FRAME`],
/// passes through unchanged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Unpadder {
    /// The next read starts a frame
    #[default]
    Idle,
    /// Body bytes still owed by the current frame
    Body(usize),
}

impl Unpadder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Range of `chunk` that carries payload
    pub fn feed(&mut self, chunk: &[u8]) -> Range<usize> {
        match *self {
            Self::Body(remaining) => {
                let take = remaining.min(chunk.len());
                if take == remaining {
                    *self = Self::Idle;
                } else {
                    *self = Self::Body(remaining - take);
                }
                0..take
            }
            Self::Idle => {
                if chunk.len() < PADDING_HEADER_LEN {
                    return 0..chunk.len();
                }
                let len = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
                if len > MAX_PADDED_FRAME {
                    return 0..chunk.len();
                }

                let available = chunk.len() - PADDING_HEADER_LEN;
                if len > available {
                    *self = Self::Body(len - available);
                    return PADDING_HEADER_LEN..chunk.len();
                }
                PADDING_HEADER_LEN..PADDING_HEADER_LEN + len
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_unpad_roundtrip() {
        let strategy = PaddingStrategy::range(8, 32).unwrap();
        let original = vec![1, 2, 3, 4, 5];

        let padded = strategy.pad(&original);
        assert!(padded.len() >= original.len() + 4 + 8);
        assert!(padded.len() <= original.len() + 4 + 32);
        assert_eq!(&padded[..4], &[0, 0, 0, 5]);

        assert_eq!(PaddingStrategy::unpad(&padded).unwrap(), &original[..]);
    }

    #[test]
    fn test_bucket_target_size() {
        let strategy = PaddingStrategy::buckets(false);

        assert_eq!(strategy.calculate_target_size(100), 512);
        assert_eq!(strategy.calculate_target_size(600), 1024);
        assert_eq!(strategy.calculate_target_size(10000), 16384);

        // Prefix counts towards the bucket
        let padded = strategy.pad(&[0u8; 100]);
        assert_eq!(padded.len(), 512);
    }

    #[test]
    fn test_bucket_jitter_bounds() {
        let strategy = PaddingStrategy::buckets(true);

        for _ in 0..100 {
            let target = strategy.calculate_target_size(100);
            assert!((461..=563).contains(&target), "{}", target);
        }
    }

    #[test]
    fn test_padding_is_random() {
        let strategy = PaddingStrategy::range(64, 64).unwrap();
        let data = vec![0u8; 10];

        let padded1 = strategy.pad(&data);
        let padded2 = strategy.pad(&data);

        // Could collide with probability 2^-512
        assert_ne!(&padded1[14..], &padded2[14..]);
    }

    #[test]
    fn test_unpadder_passes_malformed_through() {
        let mut unpadder = Unpadder::new();
        assert_eq!(unpadder.feed(b"abc"), 0..3);

        // Claims 0x7f000000 bytes
        let bogus = b"\x7f\x00\x00\x00hello";
        assert_eq!(unpadder.feed(bogus), 0..bogus.len());
        assert_eq!(unpadder, Unpadder::Idle);
    }

    #[test]
    fn test_unpadder_frame_across_reads() {
        let strategy = PaddingStrategy::range(8, 16).unwrap();
        let original: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let padded = strategy.pad(&original);

        let mut unpadder = Unpadder::new();
        let mut out = Vec::new();
        for chunk in padded.chunks(16_384) {
            let range = unpadder.feed(chunk);
            out.extend_from_slice(&chunk[range]);
        }
        assert_eq!(out, original);
        assert_eq!(unpadder, Unpadder::Idle);

        // The next read starts a fresh frame
        let next = strategy.pad(b"again");
        let range = unpadder.feed(&next);
        assert_eq!(&next[range], b"again");
    }

    #[test]
    fn test_unpadder_body_ends_mid_read() {
        let mut unpadder = Unpadder::new();
        assert_eq!(unpadder.feed(b"\x00\x00\x00\x06abc"), 4..7);
        assert_eq!(unpadder, Unpadder::Body(3));

        // Rest of the body, then padding to the end of the read
        let tail = b"defPADPAD";
        assert_eq!(&tail[unpadder.feed(tail)], b"def");
        assert_eq!(unpadder, Unpadder::Idle);
    }

    #[test]
    fn test_empty_data() {
        let strategy = PaddingStrategy::range(0, 0).unwrap();

        let padded = strategy.pad(&[]);
        assert_eq!(padded, vec![0, 0, 0, 0]);
        assert!(PaddingStrategy::unpad(&padded).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_range() {
        assert!(PaddingStrategy::range(10, 5).is_err());
    }
}
