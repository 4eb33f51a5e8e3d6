//! Timing jitter ranges

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ObfuscationError;

/// Inclusive millisecond range a delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self::ZERO
    }
}

impl DelayRange {
    /// No delay
    pub const ZERO: Self = Self::new(0, 0);

    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Constant delay
    pub const fn fixed(ms: u64) -> Self {
        Self::new(ms, ms)
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    /// Draw a random delay from the range
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(fastrand::u64(self.min_ms..=self.max_ms))
    }

    /// Same range with both bounds multiplied by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            min_ms: (self.min_ms as f64 * factor).round() as u64,
            max_ms: (self.max_ms as f64 * factor).round() as u64,
        }
    }

    pub fn validate(&self, what: &'static str) -> Result<(), ObfuscationError> {
        if self.min_ms > self.max_ms {
            return Err(ObfuscationError::InvalidRange {
                what,
                min: self.min_ms,
                max: self.max_ms,
            });
        }
        Ok(())
    }

    /// Sleep for a sampled delay
    pub async fn sleep(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
