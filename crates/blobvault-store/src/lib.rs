//! Blobvault Store - Blob store engine
//!
//! Stores immutable blobs in a single object store container. Each blob is a
//! content object plus an attribute object (headers, SHA-1, size, creation
//! time, deletion marker). Content is uploaded in fixed-size staged blocks and
//! becomes visible atomically. Deletion is two-phase: a soft delete marks the
//! blob and records a tombstone, and compaction later purges it.

pub mod attributes;
pub mod cache;
pub mod listing;
pub mod location;
pub mod metrics;
pub mod properties;
pub mod store;
pub mod uploader;

// Re-exports
pub use attributes::BlobAttributes;
pub use cache::{Blob, BlobCache, CacheStats};
pub use listing::BlobIdStream;
pub use location::{BlobIdLocationResolver, DefaultLocationResolver};
pub use metrics::MetricsStore;
pub use properties::PropertiesFile;
pub use store::{BlobStore, CompactionReport, METADATA_KEY, StoreState, UsageChecker};
pub use uploader::{ChunkedUploader, UploadOutcome};
