//! Configuration types for Blobvault
//!
//! Configuration is read from an optional TOML file and then overridden by
//! `BLOBVAULT__`-prefixed environment variables, e.g.
//! `BLOBVAULT__STORE__CHUNK_SIZE=1048576`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default upload block size (5 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "BLOBVAULT";

/// Root configuration for Blobvault
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Blob store configuration
    pub store: BlobStoreConfig,
    /// Object storage backend selection
    pub backend: BackendConfig,
    /// Deleted blob index configuration
    pub index: IndexConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option values that cannot be expressed in the types
    pub fn validate(&self) -> Result<()> {
        self.store.validate()
    }
}

/// Blob store configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Name of this blob store, used in log messages
    pub name: String,
    /// Account identity at the remote endpoint
    pub account_name: String,
    /// Access credential for the account
    pub account_key: String,
    /// Container (bucket) holding all objects of this store
    pub container_name: String,
    /// Upload block size in bytes
    pub chunk_size: usize,
    /// How long to wait for a server-side copy to finish
    pub copy_timeout_secs: u64,
    /// How long to wait for one listing page
    pub list_timeout_secs: u64,
    /// Maximum keys requested per listing page
    pub list_page_size: usize,
    /// Identity of this node, used to name the metrics snapshot
    pub node_id: String,
    /// Interval between metrics snapshot flushes
    pub metrics_flush_interval_secs: u64,
    /// Number of recently used blob handles kept alive by the cache
    pub cache_retained_handles: usize,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            account_name: String::new(),
            account_key: String::new(),
            container_name: "blobvault".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            copy_timeout_secs: 60,
            list_timeout_secs: 60,
            list_page_size: 1000,
            node_id: "local".to_string(),
            metrics_flush_interval_secs: 2,
            cache_retained_handles: 1024,
        }
    }
}

impl BlobStoreConfig {
    /// Reject values the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Configuration("chunk_size must be > 0".into()));
        }
        if self.list_page_size == 0 {
            return Err(Error::Configuration("list_page_size must be > 0".into()));
        }
        if self.container_name.trim().is_empty() {
            return Err(Error::Configuration("container_name must not be empty".into()));
        }
        if self.node_id.trim().is_empty() {
            return Err(Error::Configuration("node_id must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    #[must_use]
    pub const fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    #[must_use]
    pub fn metrics_flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_interval_secs.max(1))
    }
}

impl fmt::Debug for BlobStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStoreConfig")
            .field("name", &self.name)
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .field("container_name", &self.container_name)
            .field("chunk_size", &self.chunk_size)
            .field("copy_timeout_secs", &self.copy_timeout_secs)
            .field("list_timeout_secs", &self.list_timeout_secs)
            .field("list_page_size", &self.list_page_size)
            .field("node_id", &self.node_id)
            .field("metrics_flush_interval_secs", &self.metrics_flush_interval_secs)
            .field("cache_retained_handles", &self.cache_retained_handles)
            .finish()
    }
}

/// Which object storage client to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local, lost on exit
    Memory,
    /// Objects stored as files below a root directory
    #[default]
    Filesystem,
}

/// Object storage backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend kind
    pub kind: BackendKind,
    /// Root directory for the filesystem backend
    pub root: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Filesystem,
            root: PathBuf::from("./blobvault-data"),
        }
    }
}

/// Deleted blob index configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// redb database file; an in-memory index is used when unset
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.chunk_size, 5_242_880);
        assert_eq!(config.store.container_name, "blobvault");
        assert_eq!(config.backend.kind, BackendKind::Filesystem);
        assert!(config.index.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut config = Config::default();
        config.store.chunk_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_account_key_redacted() {
        let store = BlobStoreConfig {
            account_key: "s3cr3t".to_string(),
            ..Default::default()
        };
        let debug = format!("{store:?}");
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[store]\ncontainer_name = \"artifacts\"\nchunk_size = 1024\n\n[backend]\nkind = \"memory\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.store.container_name, "artifacts");
        assert_eq!(config.store.chunk_size, 1024);
        assert_eq!(config.store.list_page_size, 1000);
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }
}
