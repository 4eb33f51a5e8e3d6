//! Transport errors

use std::io;
use std::time::Duration;

use shroud_obfuscation::ObfuscationError;
use thiserror::Error;

/// Rejected configuration, raised at construction time only
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("max_connections must be within 1..={max}, got {value}")]
    InvalidPoolSize { value: usize, max: usize },

    #[error("{what} must be within (0, 1], got {value}")]
    InvalidRatio { what: &'static str, value: f64 },

    #[error("Invalid {what} range: min {min} > max {max}")]
    InvalidRange {
        what: &'static str,
        min: u64,
        max: u64,
    },

    #[error("Invalid packet window {from}..={to}")]
    InvalidPacketWindow { from: u64, to: u64 },

    #[error("Data limit {limit} leaves no room after the {banner}-byte SSH banner")]
    LimitBelowBanner { limit: u64, banner: usize },

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("Obfuscation config: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("Failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors on the stream's data path
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Dial failed: {0}")]
    Dial(#[source] io::Error),

    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Deadline exceeded")]
    Timeout,

    #[error("Stream is closed")]
    Closed,

    #[error("Connection {0} has no capacity left under the data limit")]
    NoCapacity(u64),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl StreamError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::Dial(e) => io::Error::new(e.kind(), StreamError::Dial(e)),
            StreamError::DialTimeout(_) | StreamError::Timeout => {
                io::Error::new(io::ErrorKind::TimedOut, err)
            }
            StreamError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            StreamError::NoCapacity(_) => io::Error::new(io::ErrorKind::WriteZero, err),
            StreamError::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    }
}

/// A write that stopped partway
///
/// `flushed` counts bytes of the caller's original payload that reached the
/// wire, never obfuscation overhead.
#[derive(Error, Debug)]
#[error("Write failed after {flushed} bytes: {source}")]
pub struct PartialWrite {
    pub flushed: usize,
    #[source]
    pub source: StreamError,
}

impl PartialWrite {
    pub fn new(flushed: usize, source: StreamError) -> Self {
        Self { flushed, source }
    }

    /// Nothing flushed
    pub fn none(source: StreamError) -> Self {
        Self::new(0, source)
    }

    pub fn into_source(self) -> StreamError {
        self.source
    }
}

impl From<PartialWrite> for io::Error {
    fn from(err: PartialWrite) -> Self {
        err.source.into()
    }
}
