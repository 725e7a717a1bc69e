//! # LMX Core
//!
//! Foundation library for the LMX local inference runtime.
//! Provides layered configuration, error types, and the atomic JSON
//! persistence used by the on-disk registries.

pub mod config;
pub mod error;
pub mod persistence;

// Re-export commonly used types at the crate root.
pub use config::{
    BackendsConfig, ConcurrencyConfig, EvictionConfig, LmxConfig, LoaderConfig, MemoryConfig,
    StorageConfig, load_config, load_config_file,
};
pub use error::{ConfigError, LmxError, Result};
