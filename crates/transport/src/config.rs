//! Evasion configuration

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use shroud_obfuscation::{DelayRange, ObfuscationProfile, WhitelistSet};
use tracing::debug;

use crate::error::ConfigError;
use crate::ssh::SSH_BANNER;

/// Default fragment size (15 KB)
pub const DEFAULT_FRAGMENT_SIZE: usize = 15 * 1024;

/// Smallest fragment size a configured `size` is clamped to
pub const MIN_FRAGMENT_SIZE: usize = 10 * 1024;

/// Largest fragment size a configured `size` is clamped to
pub const MAX_FRAGMENT_SIZE: usize = 20 * 1024;

/// Default bytes per physical connection (15 KB)
pub const DEFAULT_DATA_LIMIT: u64 = 15 * 1024;

/// Conservative limit used when the adaptive probe finds nothing
pub const MIN_DATA_LIMIT: u64 = 10 * 1024;

/// Hard upper bound on connections per stream
pub const MAX_CONCURRENT_CONNECTIONS: usize = 16;

/// Chunk size distribution for generic fragmentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeDistribution {
    #[default]
    Uniform,
    /// Skewed towards `min_size`, mean at a third of the range
    Exponential,
}

impl SizeDistribution {
    /// Draw a size in `[min, max]`
    pub fn sample(&self, min: usize, max: usize) -> usize {
        if max <= min {
            return min;
        }
        match self {
            Self::Uniform => fastrand::usize(min..=max),
            Self::Exponential => {
                let lambda = 3.0 / (max - min) as f64;
                let x = -(1.0 - fastrand::f64()).ln() / lambda;
                ((min as f64 + x) as usize).clamp(min, max)
            }
        }
    }
}

/// ClientHello splitting parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TlsFragmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Records at or below this length are not split specially
    #[serde(default = "default_tls_min_record")]
    pub min_record_len: usize,

    /// End of the first fragment, placed just before the SNI in a typical hello
    #[serde(default = "default_tls_first_split")]
    pub first_split: usize,

    /// Chunk size range after the first fragment
    #[serde(default = "default_tls_chunk_min")]
    pub chunk_min: usize,
    #[serde(default = "default_tls_chunk_max")]
    pub chunk_max: usize,

    /// Byte window assumed to hold the hostname, split into micro chunks
    #[serde(default = "default_sni_window_start")]
    pub sni_window_start: usize,
    #[serde(default = "default_sni_window_end")]
    pub sni_window_end: usize,
    #[serde(default = "default_sni_chunk_min")]
    pub sni_chunk_min: usize,
    #[serde(default = "default_sni_chunk_max")]
    pub sni_chunk_max: usize,

    /// Pause after the first fragment
    #[serde(default = "default_tls_first_delay")]
    pub first_delay: DelayRange,

    /// Pause before each later chunk
    #[serde(default = "default_tls_chunk_delay")]
    pub chunk_delay: DelayRange,

    /// Multiplier applied to `chunk_delay` inside the SNI window
    #[serde(default = "default_sni_delay_scale")]
    pub sni_delay_scale: f64,
}

fn default_true() -> bool {
    true
}

fn default_tls_min_record() -> usize {
    50
}

fn default_tls_first_split() -> usize {
    43
}

fn default_tls_chunk_min() -> usize {
    20
}

fn default_tls_chunk_max() -> usize {
    100
}

fn default_sni_window_start() -> usize {
    40
}

fn default_sni_window_end() -> usize {
    100
}

fn default_sni_chunk_min() -> usize {
    3
}

fn default_sni_chunk_max() -> usize {
    10
}

fn default_tls_first_delay() -> DelayRange {
    DelayRange::new(10, 50)
}

fn default_tls_chunk_delay() -> DelayRange {
    DelayRange::new(5, 20)
}

fn default_sni_delay_scale() -> f64 {
    1.5
}

impl Default for TlsFragmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_record_len: default_tls_min_record(),
            first_split: default_tls_first_split(),
            chunk_min: default_tls_chunk_min(),
            chunk_max: default_tls_chunk_max(),
            sni_window_start: default_sni_window_start(),
            sni_window_end: default_sni_window_end(),
            sni_chunk_min: default_sni_chunk_min(),
            sni_chunk_max: default_sni_chunk_max(),
            first_delay: default_tls_first_delay(),
            chunk_delay: default_tls_chunk_delay(),
            sni_delay_scale: default_sni_delay_scale(),
        }
    }
}

/// `Host:` splitting parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpFragmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pause between the pre-`Host:` part and `Ho`
    #[serde(default = "default_http_host_delay")]
    pub host_delay: DelayRange,

    /// Pause between `Ho` and the rest
    #[serde(default = "default_http_split_delay")]
    pub split_delay: DelayRange,
}

fn default_http_host_delay() -> DelayRange {
    DelayRange::new(10, 30)
}

fn default_http_split_delay() -> DelayRange {
    DelayRange::new(5, 15)
}

impl Default for HttpFragmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_delay: default_http_host_delay(),
            split_delay: default_http_split_delay(),
        }
    }
}

/// Fragmentation configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FragmentConfig {
    /// Master switch; when off every write goes out whole
    #[serde(default)]
    pub enabled: bool,

    /// Fixed fragment size (clamped to [10 KB, 20 KB], 0 means 15 KB)
    #[serde(default = "default_fragment_size")]
    pub size: usize,

    /// Draw sizes from `[min_size, max_size]` instead of using `size`
    #[serde(default)]
    pub random_size: bool,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub distribution: SizeDistribution,

    /// Pause between generic fragments
    #[serde(default = "default_interval")]
    pub interval: DelayRange,

    /// Cap on fragments per write (0 = unlimited); the last one takes the rest
    #[serde(default)]
    pub max_fragments: usize,

    /// 1-based write indices to fragment (0 = every write)
    #[serde(default)]
    pub packets_from: u64,
    #[serde(default)]
    pub packets_to: u64,

    #[serde(default)]
    pub tls: TlsFragmentConfig,

    #[serde(default)]
    pub http: HttpFragmentConfig,
}

fn default_fragment_size() -> usize {
    DEFAULT_FRAGMENT_SIZE
}

fn default_min_size() -> usize {
    MIN_FRAGMENT_SIZE
}

fn default_max_size() -> usize {
    MAX_FRAGMENT_SIZE
}

fn default_interval() -> DelayRange {
    DelayRange::fixed(10)
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_fragment_size(),
            random_size: false,
            min_size: default_min_size(),
            max_size: default_max_size(),
            distribution: SizeDistribution::Uniform,
            interval: default_interval(),
            max_fragments: 0,
            packets_from: 0,
            packets_to: 0,
            tls: TlsFragmentConfig::default(),
            http: HttpFragmentConfig::default(),
        }
    }
}

impl FragmentConfig {
    /// Enabled config with a fixed fragment size
    pub fn fixed(size: usize) -> Self {
        Self {
            enabled: true,
            size,
            ..Default::default()
        }
    }

    /// Enabled config with random sizes
    pub fn random(min_size: usize, max_size: usize) -> Self {
        Self {
            enabled: true,
            random_size: true,
            min_size,
            max_size,
            ..Default::default()
        }
    }

    /// Clamp sizes into their allowed ranges
    pub fn normalized(mut self) -> Self {
        let size = clamp_fragment_size(self.size);
        if size != self.size {
            debug!("Fragment size {} clamped to {}", self.size, size);
            self.size = size;
        }

        if self.min_size == 0 || self.max_size == 0 || self.min_size > self.max_size {
            debug!(
                "Fragment size range {}..={} reset to defaults",
                self.min_size, self.max_size
            );
            self.min_size = MIN_FRAGMENT_SIZE;
            self.max_size = MAX_FRAGMENT_SIZE;
        }

        self
    }

    /// Reject ranges that cannot be clamped into shape
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packets_from != 0 && self.packets_from > self.packets_to {
            return Err(ConfigError::InvalidPacketWindow {
                from: self.packets_from,
                to: self.packets_to,
            });
        }

        let tls = &self.tls;
        check_range("tls chunk", tls.chunk_min, tls.chunk_max)?;
        check_range("sni chunk", tls.sni_chunk_min, tls.sni_chunk_max)?;
        check_range("sni window", tls.sni_window_start, tls.sni_window_end)?;
        if tls.chunk_min == 0 || tls.sni_chunk_min == 0 {
            return Err(ConfigError::Zero("tls chunk size"));
        }
        if !(tls.sni_delay_scale.is_finite() && tls.sni_delay_scale >= 0.0) {
            return Err(ConfigError::InvalidRatio {
                what: "sni_delay_scale",
                value: tls.sni_delay_scale,
            });
        }

        for (what, range) in [
            ("interval", self.interval),
            ("tls first delay", tls.first_delay),
            ("tls chunk delay", tls.chunk_delay),
            ("http host delay", self.http.host_delay),
            ("http split delay", self.http.split_delay),
        ] {
            range.validate(what)?;
        }

        Ok(())
    }
}

/// 0 -> default, above max -> max, below min -> min
pub fn clamp_fragment_size(size: usize) -> usize {
    if size == 0 {
        DEFAULT_FRAGMENT_SIZE
    } else {
        size.clamp(MIN_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE)
    }
}

fn check_range(what: &'static str, min: usize, max: usize) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidRange {
            what,
            min: min as u64,
            max: max as u64,
        });
    }
    Ok(())
}

/// Connection rotation configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MultiplexConfig {
    /// Bytes (written + read) one physical connection may carry; 0 means default
    #[serde(default = "default_data_limit")]
    pub data_limit: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Rotate to another connection when the limit is approached
    #[serde(default = "default_true")]
    pub rotate_on_limit: bool,

    /// Probe the provider's limit before the first real connection
    #[serde(default)]
    pub adaptive_limit: bool,

    /// Open each connection with an SSH banner exchange
    #[serde(default)]
    pub mask_as_ssh: bool,

    /// Fraction of the limit at which rotation triggers
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    /// Existing connections below this fraction of the limit may be reused
    #[serde(default = "default_reuse_watermark")]
    pub reuse_watermark: f64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Candidate limits tried by the adaptive probe, largest first
    #[serde(default = "default_probe_sizes")]
    pub probe_sizes: Vec<u64>,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Fraction of the first working probe size that becomes the limit
    #[serde(default = "default_probe_safety_factor")]
    pub probe_safety_factor: f64,
}

fn default_data_limit() -> u64 {
    DEFAULT_DATA_LIMIT
}

fn default_max_connections() -> usize {
    8
}

fn default_safety_margin() -> f64 {
    0.95
}

fn default_reuse_watermark() -> f64 {
    0.8
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_probe_sizes() -> Vec<u64> {
    vec![20 * 1024, 18 * 1024, 15 * 1024, 12 * 1024, 10 * 1024]
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_safety_factor() -> f64 {
    0.9
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self {
            data_limit: default_data_limit(),
            max_connections: default_max_connections(),
            rotate_on_limit: true,
            adaptive_limit: false,
            mask_as_ssh: false,
            safety_margin: default_safety_margin(),
            reuse_watermark: default_reuse_watermark(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            probe_sizes: default_probe_sizes(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_safety_factor: default_probe_safety_factor(),
        }
    }
}

impl MultiplexConfig {
    /// Config with a given per-connection limit
    pub fn with_limit(data_limit: u64) -> Self {
        Self {
            data_limit,
            ..Default::default()
        }
    }

    /// Effective limit (0 means default)
    pub fn effective_limit(&self) -> u64 {
        if self.data_limit == 0 {
            DEFAULT_DATA_LIMIT
        } else {
            self.data_limit
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections > MAX_CONCURRENT_CONNECTIONS {
            return Err(ConfigError::InvalidPoolSize {
                value: self.max_connections,
                max: MAX_CONCURRENT_CONNECTIONS,
            });
        }

        for (what, value) in [
            ("safety_margin", self.safety_margin),
            ("reuse_watermark", self.reuse_watermark),
            ("probe_safety_factor", self.probe_safety_factor),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidRatio { what, value });
            }
        }
        if self.reuse_watermark > self.safety_margin {
            return Err(ConfigError::InvalidRatio {
                what: "reuse_watermark (above safety_margin)",
                value: self.reuse_watermark,
            });
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("sweep_interval_secs"));
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::Zero("dial_timeout_secs"));
        }
        if self.adaptive_limit && self.probe_timeout_secs == 0 {
            return Err(ConfigError::Zero("probe_timeout_secs"));
        }

        if self.mask_as_ssh && self.rotate_on_limit {
            let threshold = rotation_threshold(self.effective_limit(), self.safety_margin);
            if threshold <= 2 * SSH_BANNER.len() as u64 {
                return Err(ConfigError::LimitBelowBanner {
                    limit: self.effective_limit(),
                    banner: SSH_BANNER.len(),
                });
            }
        }

        Ok(())
    }
}

/// Usage level at which a connection is rotated away from
pub fn rotation_threshold(limit: u64, margin: f64) -> u64 {
    ((limit as f64 * margin) as u64).max(1)
}

/// Whitelist seeding
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WhitelistConfig {
    /// Start from the built-in domain list
    #[serde(default = "default_true")]
    pub use_defaults: bool,

    /// Extra domains
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            domains: Vec::new(),
        }
    }
}

impl WhitelistConfig {
    pub fn build(&self) -> WhitelistSet {
        let set = if self.use_defaults {
            WhitelistSet::with_defaults()
        } else {
            WhitelistSet::new()
        };
        for domain in &self.domains {
            set.add(domain);
        }
        set
    }
}

/// Everything an `EvasionStream` needs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvasionConfig {
    #[serde(default)]
    pub fragment: FragmentConfig,

    #[serde(default)]
    pub multiplex: MultiplexConfig,

    #[serde(default)]
    pub obfuscation: ObfuscationProfile,

    #[serde(default)]
    pub whitelist: WhitelistConfig,
}

impl EvasionConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EvasionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fragment.validate()?;
        self.multiplex.validate()?;
        self.obfuscation.validate()?;
        Ok(())
    }
}
