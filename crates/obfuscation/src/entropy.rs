//! Entropy shaping
//!
//! Encrypted payloads look uniformly random, which is itself a signal.
//! High-entropy buffers get a fixed low-entropy pattern spliced in after
//! every block, lowering the apparent randomness at the cost of size.

use serde::{Deserialize, Serialize};

use crate::error::ObfuscationError;

/// Patterns spliced into high-entropy data
pub const DEFAULT_PATTERNS: [&[u8; 16]; 5] = [
    b"padding123456789",
    b"abcdefghijklmnop",
    b"1234567890123456",
    b"________________",
    b"................",
];

/// Entropy shaping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    pub enabled: bool,
    /// Normalized entropy (0..=1) above which shaping kicks in
    pub target: f64,
    /// Bytes of payload between inserted patterns
    pub block_size: usize,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: 0.7,
            block_size: 1024,
        }
    }
}

/// Result of shaping one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shaped {
    pub data: Vec<u8>,
    /// Bytes added on top of the input
    pub inserted: usize,
    /// Length of the pattern used (0 when nothing was inserted)
    pub pattern_len: usize,
}

/// Lowers the apparent entropy of outbound buffers
#[derive(Debug, Clone)]
pub struct EntropyShaper {
    target: f64,
    block_size: usize,
    patterns: Vec<Vec<u8>>,
}

impl EntropyShaper {
    pub fn new(config: &EntropyConfig) -> Result<Self, ObfuscationError> {
        Self::with_patterns(
            config.target,
            config.block_size,
            DEFAULT_PATTERNS.iter().map(|p| p.to_vec()).collect(),
        )
    }

    pub fn with_patterns(
        target: f64,
        block_size: usize,
        patterns: Vec<Vec<u8>>,
    ) -> Result<Self, ObfuscationError> {
        if !(target > 0.0 && target <= 1.0) {
            return Err(ObfuscationError::InvalidEntropyTarget(target));
        }
        if block_size == 0 || patterns.is_empty() || patterns.iter().any(|p| p.is_empty()) {
            return Err(ObfuscationError::EmptyPattern);
        }
        Ok(Self {
            target,
            block_size,
            patterns,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Splice one randomly chosen pattern after every full block that is not last
    pub fn shape(&self, data: &[u8]) -> Shaped {
        if normalized_entropy(data) <= self.target || data.len() <= self.block_size {
            return Shaped {
                data: data.to_vec(),
                inserted: 0,
                pattern_len: 0,
            };
        }

        let pattern = &self.patterns[fastrand::usize(0..self.patterns.len())];
        let gaps = (data.len() - 1) / self.block_size;
        let mut out = Vec::with_capacity(data.len() + gaps * pattern.len());

        let mut chunks = data.chunks(self.block_size).peekable();
        while let Some(chunk) = chunks.next() {
            out.extend_from_slice(chunk);
            if chunks.peek().is_some() {
                out.extend_from_slice(pattern);
            }
        }

        Shaped {
            inserted: out.len() - data.len(),
            pattern_len: pattern.len(),
            data: out,
        }
    }
}

/// Shannon entropy in bits per byte (0..=8)
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0usize; 256];
    for &b in data {
        freq[b as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Shannon entropy scaled to 0..=1
pub fn normalized_entropy(data: &[u8]) -> f64 {
    shannon_entropy(data) / 8.0
}
