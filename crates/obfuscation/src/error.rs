//! Obfuscation errors

use thiserror::Error;

/// Errors raised when building obfuscation components
///
/// All of these are construction-time errors. Transforms themselves never fail:
/// input they cannot handle is passed through unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObfuscationError {
    #[error("Invalid {what} range: min {min} > max {max}")]
    InvalidRange {
        what: &'static str,
        min: u64,
        max: u64,
    },

    #[error("Entropy target must be within (0, 1], got {0}")]
    InvalidEntropyTarget(f64),

    #[error("Entropy shaping needs a non-zero block size and at least one non-empty pattern")]
    EmptyPattern,
}
