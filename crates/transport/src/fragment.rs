//! Fragmentation planner
//!
//! Turns one logical write into an ordered list of contiguous byte ranges,
//! each with the pause to take before sending it. Three strategies:
//!
//! - TLS: short first fragment ending before the SNI, then small chunks with
//!   micro chunks over the hostname window (first write of a stream only)
//! - HTTP: split right inside the `Host` keyword
//! - Generic: fixed or random sized chunks
//!
//! Parsing failures always fall back to the generic strategy.

use std::ops::Range;
use std::time::Duration;

use shroud_protocol::{
    Classification, ClientHello, declared_record_len, find_host_header, is_http_request_any_case,
};
use tracing::{debug, trace};

use crate::config::{FragmentConfig, TlsFragmentConfig};
use crate::error::ConfigError;

/// One contiguous slice of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: usize,
    pub len: usize,
    /// Pause before this fragment goes out
    pub delay: Duration,
}

impl Fragment {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.range()]
    }
}

/// Which strategy produced a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Single fragment, no splitting
    Passthrough,
    Tls,
    Http,
    Generic,
}

/// Ordered fragments covering a payload exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPlan {
    pub strategy: Strategy,
    fragments: Vec<Fragment>,
}

impl FragmentPlan {
    /// Whole payload in one piece
    pub fn single(len: usize) -> Self {
        let fragments = if len == 0 {
            Vec::new()
        } else {
            vec![Fragment {
                offset: 0,
                len,
                delay: Duration::ZERO,
            }]
        };
        Self {
            strategy: Strategy::Passthrough,
            fragments,
        }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Bytes covered by the plan
    pub fn total_len(&self) -> usize {
        self.fragments.last().map(|f| f.end()).unwrap_or(0)
    }

    /// Sum of all planned pauses
    pub fn total_delay(&self) -> Duration {
        self.fragments.iter().map(|f| f.delay).sum()
    }

    /// Fragment payloads in send order
    pub fn slices<'a>(&'a self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.fragments.iter().map(move |f| f.slice(data))
    }
}

/// Accumulates fragments while a strategy walks a payload
struct PlanBuilder {
    fragments: Vec<Fragment>,
    pos: usize,
}

impl PlanBuilder {
    fn new() -> Self {
        Self {
            fragments: Vec::new(),
            pos: 0,
        }
    }

    fn push(&mut self, len: usize, delay: Duration) {
        debug_assert!(len > 0);
        self.fragments.push(Fragment {
            offset: self.pos,
            len,
            delay,
        });
        self.pos += len;
    }

    fn finish(self, strategy: Strategy) -> FragmentPlan {
        FragmentPlan {
            strategy,
            fragments: self.fragments,
        }
    }
}

/// The fragmentation engine's planning half
#[derive(Debug, Clone)]
pub struct Fragmenter {
    config: FragmentConfig,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self {
            config: FragmentConfig::default().normalized(),
        }
    }
}

impl Fragmenter {
    /// Normalize and validate `config`
    pub fn new(config: FragmentConfig) -> Result<Self, ConfigError> {
        let config = config.normalized();
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether the 1-based write index falls inside `packets_from..=packets_to`
    pub fn in_window(&self, write_index: u64) -> bool {
        let (from, to) = (self.config.packets_from, self.config.packets_to);
        if from == 0 && to == 0 {
            return true;
        }
        write_index >= from && write_index <= to
    }

    /// Plan the `write_index`-th write (1-based) of a stream classified as `class`
    pub fn plan(&self, data: &[u8], class: Classification, write_index: u64) -> FragmentPlan {
        if data.is_empty() || !self.config.enabled {
            return FragmentPlan::single(data.len());
        }

        match class {
            Classification::TlsHandshake if write_index == 1 && self.config.tls.enabled => {
                if let Some(plan) = plan_tls(&self.config.tls, data) {
                    trace!("TLS plan: {} fragments for {} bytes", plan.len(), data.len());
                    return plan;
                }
                debug!("ClientHello not splittable, using generic strategy");
            }
            Classification::HttpRequest
                if self.config.http.enabled && is_http_request_any_case(data) =>
            {
                if let Some(plan) = self.plan_http(data) {
                    trace!("HTTP plan: Host split for {} bytes", data.len());
                    return plan;
                }
                debug!("No Host header found, using generic strategy");
            }
            _ => {}
        }

        if !self.in_window(write_index) {
            return FragmentPlan::single(data.len());
        }
        self.plan_generic(data)
    }

    fn plan_http(&self, data: &[u8]) -> Option<FragmentPlan> {
        let host = find_host_header(data)?;
        let http = &self.config.http;

        let mut plan = PlanBuilder::new();
        plan.push(host, Duration::ZERO);
        plan.push(2, http.host_delay.sample());
        if data.len() > host + 2 {
            plan.push(data.len() - host - 2, http.split_delay.sample());
        }
        Some(plan.finish(Strategy::Http))
    }

    fn plan_generic(&self, data: &[u8]) -> FragmentPlan {
        let config = &self.config;
        let mut plan = PlanBuilder::new();

        while plan.pos < data.len() {
            let remaining = data.len() - plan.pos;
            let last_allowed =
                config.max_fragments != 0 && plan.fragments.len() + 1 >= config.max_fragments;

            let len = if last_allowed {
                remaining
            } else if config.random_size {
                let size = config
                    .distribution
                    .sample(config.min_size, config.max_size);
                if remaining <= size || remaining - size < config.min_size {
                    remaining
                } else {
                    size
                }
            } else {
                config.size.min(remaining)
            };

            let delay = if plan.fragments.is_empty() {
                Duration::ZERO
            } else {
                config.interval.sample()
            };
            plan.push(len, delay);
        }

        plan.finish(Strategy::Generic)
    }
}

fn plan_tls(tls: &TlsFragmentConfig, data: &[u8]) -> Option<FragmentPlan> {
    let record_len = declared_record_len(data)?;
    if data.len() < record_len || record_len <= tls.min_record_len {
        return None;
    }

    let first = if record_len > tls.first_split {
        tls.first_split
    } else {
        record_len / 2
    };
    if first == 0 {
        return None;
    }

    let windows = sni_windows(tls, data);
    let mut plan = PlanBuilder::new();
    plan.push(first, Duration::ZERO);

    while plan.pos < data.len() {
        let pos = plan.pos;
        let remaining = data.len() - pos;

        let (len, in_window) = match windows.iter().find(|w| w.contains(&pos)) {
            Some(window) => {
                let size = fastrand::usize(tls.sni_chunk_min..=tls.sni_chunk_max);
                (size.min(window.end - pos), true)
            }
            None => {
                let limit = windows
                    .iter()
                    .map(|w| w.start)
                    .find(|&start| start > pos)
                    .unwrap_or(data.len());
                let span = limit - pos;
                let mut size = fastrand::usize(tls.chunk_min..=tls.chunk_max).min(span);

                // Tail of the payload: never leave a runt chunk behind
                let rest = span - size;
                if limit == data.len() && rest > 0 && rest < tls.chunk_min {
                    size = if span <= tls.chunk_max {
                        span
                    } else {
                        span - tls.chunk_min
                    };
                }
                (size, false)
            }
        };

        let delay = if plan.fragments.len() == 1 {
            tls.first_delay.sample()
        } else if in_window {
            tls.chunk_delay.scaled(tls.sni_delay_scale).sample()
        } else {
            tls.chunk_delay.sample()
        };

        plan.push(len.min(remaining), delay);
    }

    Some(plan.finish(Strategy::Tls))
}

/// Fixed hostname window plus the parsed SNI range, merged and clipped to the payload
fn sni_windows(tls: &TlsFragmentConfig, data: &[u8]) -> Vec<Range<usize>> {
    let mut windows = Vec::with_capacity(2);

    let fixed = tls.sni_window_start.min(data.len())..tls.sni_window_end.min(data.len());
    if !fixed.is_empty() {
        windows.push(fixed);
    }

    match ClientHello::parse(data) {
        Ok(hello) => {
            if let Some(sni) = hello.sni_range() {
                windows.push(sni);
            }
        }
        Err(e) => debug!("ClientHello parse failed ({}), using fixed SNI window", e),
    }

    windows.sort_by_key(|w| w.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.last_mut() {
            Some(last) if window.start <= last.end => last.end = last.end.max(window.end),
            _ => merged.push(window),
        }
    }
    merged
}
