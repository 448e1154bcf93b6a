//! Error types for Blobvault
//!
//! Missing blobs are not errors: engine operations report them as `None` or
//! `false`. Everything else surfaces as an [`Error`], wrapped in
//! [`Error::Blob`] whenever the blob being operated on is known.

use crate::types::BlobId;
use thiserror::Error;

/// Common result type for Blobvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Blobvault
#[derive(Debug, Error)]
pub enum Error {
    // Object store errors
    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Blob store errors
    #[error("blob {blob_id}: {source}")]
    Blob {
        blob_id: BlobId,
        #[source]
        source: Box<Error>,
    },

    #[error("blob not found: {0}")]
    BlobNotFound(BlobId),

    #[error("unsupported blob store type/version: {found} in {key}")]
    VersionMismatch { found: String, key: String },

    #[error("blob store is not started (state: {0})")]
    NotStarted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Persistence errors
    #[error("invalid properties in {key}: {reason}")]
    Properties { key: String, reason: String },

    #[error("deleted blob index error: {0}")]
    Index(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an object store error
    pub fn object_store(msg: impl Into<String>) -> Self {
        Self::ObjectStore(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Attach the blob this error happened on. Already-attributed errors are
    /// returned unchanged.
    #[must_use]
    pub fn with_blob(self, blob_id: &BlobId) -> Self {
        match self {
            Self::Blob { .. } | Self::BlobNotFound(_) => self,
            other => Self::Blob {
                blob_id: blob_id.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Blob this error is attributed to, if any
    #[must_use]
    pub fn blob_id(&self) -> Option<&BlobId> {
        match self {
            Self::Blob { blob_id, .. } | Self::BlobNotFound(blob_id) => Some(blob_id),
            _ => None,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ServiceUnavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            Self::Blob { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ObjectNotFound(_) | Self::ContainerNotFound(_) | Self::BlobNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Blob { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
