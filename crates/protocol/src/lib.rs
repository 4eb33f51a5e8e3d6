//! Shroud Protocol - recognizing what an outbound payload is
//!
//! This crate provides:
//! - `classify`: tagging the first bytes of a write as TLS handshake, HTTP request or generic
//! - `ClientHello`: a zero-copy view over a TLS ClientHello record (extensions, SNI location)
//! - HTTP request-head helpers (header boundaries, `Host:` lookup)
//!
//! Nothing here mutates a payload. Rewriting lives in `shroud-obfuscation`.

mod classify;
mod http;
mod tls;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use classify::*;
pub use http::*;
pub use tls::*;
