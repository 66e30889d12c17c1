//! StrataDB common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all StrataDB components.

pub mod chunk;
pub mod config;
pub mod error;
pub mod types;

pub use chunk::{ChunkKey, SCRATCH_SENTINEL};
pub use config::PoolConfig;
pub use error::{Result, StrataError};
pub use types::{DeviceId, EncoderMeta, Encoding};
