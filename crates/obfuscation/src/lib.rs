//! Shroud Obfuscation - content-level traffic disguise
//!
//! This crate provides:
//! - Length-prefixed random padding (range or size-bucket mode)
//! - HTTP header case/whitespace randomization and decoy headers
//! - ClientHello extension shuffling and RFC 7685 padding
//! - SNI masking against a runtime-mutable whitelist
//! - Entropy shaping
//! - Timing ranges shared with the fragmenter
//!
//! `Obfuscator` composes the transforms according to an `ObfuscationProfile`.

mod decoy;
mod entropy;
mod error;
mod headers;
mod padding;
mod profile;
mod sni;
mod timing;
mod tls_ext;
mod whitelist;

pub use decoy::*;
pub use entropy::*;
pub use error::*;
pub use headers::*;
pub use padding::*;
pub use profile::*;
pub use sni::*;
pub use timing::*;
pub use tls_ext::*;
pub use whitelist::*;
