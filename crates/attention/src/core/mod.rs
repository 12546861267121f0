//! Types shared across the attention engines.

pub mod config;
pub mod errors;

pub use config::KernelOptions;
pub use errors::{AttentionError, Result};
