//! Shroud Transport - fragmenting, rotating connection layer
//!
//! This crate provides:
//! - Dialer seam over TCP or any async byte stream
//! - Fragmentation planner (TLS / HTTP / generic strategies) and executor
//! - Single-connection `FragmentWriter`
//! - Connection rotation pool with idle sweep and adaptive limit probe
//! - SSH banner masking
//! - `EvasionStream`, a drop-in duplex connection tying it all together

mod config;
mod connection;
mod engine;
mod error;
mod fragment;
mod pool;
mod probe;
mod ssh;
mod stream;

pub use config::*;
pub use connection::*;
pub use engine::*;
pub use error::*;
pub use fragment::*;
pub use pool::*;
pub use probe::*;
pub use ssh::*;
pub use stream::*;
