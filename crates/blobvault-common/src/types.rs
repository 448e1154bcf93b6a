//! Core type definitions for Blobvault
//!
//! Blob identifiers, header names, per-blob metrics and store-wide metrics.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Header carrying the caller-visible name of a blob
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";

/// Header naming the principal that created a blob
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";

/// Header marking a blob as addressed by its name rather than a generated id
pub const DIRECT_PATH_BLOB_HEADER: &str = "BlobStore.direct-path";

/// Header marking a blob as temporary
pub const TEMPORARY_BLOB_HEADER: &str = "BlobStore.temporary-blob";

/// Header carrying the content type of a blob
pub const CONTENT_TYPE_HEADER: &str = "BlobStore.content-type";

/// Id prefix for direct-path blobs
pub const DIRECT_PATH_ID_PREFIX: &str = "path$";

/// Id prefix for temporary blobs
pub const TEMPORARY_ID_PREFIX: &str = "tmp$";

/// Blob headers, ordered so persisted attribute objects are stable
pub type Headers = BTreeMap<String, String>;

/// Opaque identifier of one logical blob
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BlobId(String);

impl BlobId {
    /// Wrap an existing identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new permanent blob id
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Generate a new temporary blob id
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Build the id of a direct-path blob from its name
    #[must_use]
    pub fn direct_path(name: &str) -> Self {
        Self(format!(
            "{DIRECT_PATH_ID_PREFIX}{}",
            name.trim_start_matches('/')
        ))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the blob is addressed by a caller-supplied name
    #[must_use]
    pub fn is_direct_path(&self) -> bool {
        self.0.starts_with(DIRECT_PATH_ID_PREFIX)
    }

    /// True if the blob was created as a temporary blob
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }

    /// Name portion of a direct-path id
    #[must_use]
    pub fn direct_path_name(&self) -> Option<&str> {
        self.0.strip_prefix(DIRECT_PATH_ID_PREFIX)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({:?})", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Content metrics recorded when a blob is written
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetrics {
    /// When the content was written
    pub creation_time: DateTime<Utc>,
    /// Lowercase hex SHA-1 of the content
    pub sha1_hash: String,
    /// Content length in bytes
    pub content_size: u64,
}

impl BlobMetrics {
    #[must_use]
    pub fn new(creation_time: DateTime<Utc>, sha1_hash: impl Into<String>, content_size: u64) -> Self {
        Self {
            creation_time,
            sha1_hash: sha1_hash.into(),
            content_size,
        }
    }
}

/// Capacity left in the backing store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailableSpace {
    /// The backend has no capacity ceiling we can observe
    Unbounded,
    /// Known number of free bytes
    Bytes(u64),
}

impl fmt::Display for AvailableSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => write!(f, "unbounded"),
            Self::Bytes(n) => write!(f, "{n}"),
        }
    }
}

/// Store-wide metrics snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStoreMetrics {
    /// Number of blobs written and not yet hard-deleted
    pub blob_count: u64,
    /// Sum of content sizes of those blobs
    pub total_size: u64,
    /// Remaining capacity
    pub available_space: AvailableSpace,
    /// Whether the store accepts writes
    pub writable: bool,
}
