//! Blobvault Common - Shared types and utilities
//!
//! This crate provides the blob identifiers, metric records, error
//! definitions, configuration and checksum helpers used across all
//! Blobvault components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Sha1Calculator, StreamMetrics};
pub use self::config::{
    BackendConfig, BackendKind, BlobStoreConfig, Config, IndexConfig, LoggingConfig,
};
pub use error::{Error, Result};
pub use types::*;
