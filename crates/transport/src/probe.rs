//! Adaptive data-limit probe
//!
//! Before the pool starts, throwaway connections try writes of descending
//! sizes. The first size that goes through, scaled down by a safety factor,
//! becomes the per-connection ceiling.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{MIN_DATA_LIMIT, MultiplexConfig};
use crate::connection::Dialer;

/// Outcome of a probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Largest candidate that went through, if any
    pub accepted: Option<u64>,
    /// Ceiling to use
    pub limit: u64,
}

/// Find the provider's per-connection limit, falling back to `MIN_DATA_LIMIT`
pub async fn detect_limit(dialer: &dyn Dialer, config: &MultiplexConfig) -> ProbeResult {
    for &size in &config.probe_sizes {
        if probe_size(dialer, size, config.dial_timeout(), config.probe_timeout()).await {
            let limit = ((size as f64 * config.probe_safety_factor) as u64).max(1);
            info!("Detected provider limit: {} bytes (using {})", size, limit);
            return ProbeResult {
                accepted: Some(size),
                limit,
            };
        }
        debug!("Probe of {} bytes failed", size);
    }

    warn!(
        "Limit probe failed for every size, using {} bytes",
        MIN_DATA_LIMIT
    );
    ProbeResult {
        accepted: None,
        limit: MIN_DATA_LIMIT,
    }
}

/// One throwaway connection carrying `size` random bytes
async fn probe_size(
    dialer: &dyn Dialer,
    size: u64,
    dial_timeout: Duration,
    write_timeout: Duration,
) -> bool {
    let mut conn = match tokio::time::timeout(dial_timeout, dialer.dial()).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            debug!("Probe dial failed: {}", e);
            return false;
        }
        Err(_) => return false,
    };

    let data: Vec<u8> = (0..size).map(|_| fastrand::u8(..)).collect();
    let written = tokio::time::timeout(write_timeout, async {
        conn.write_all(&data).await?;
        conn.flush().await
    })
    .await;

    let _ = conn.shutdown().await;
    matches!(written, Ok(Ok(())))
}
