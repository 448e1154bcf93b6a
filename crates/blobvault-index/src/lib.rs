//! Blobvault Index - Deleted-blob tombstones
//!
//! Soft-deleting a blob leaves its objects in place and records the id here.
//! Compaction later browses the index and purges each entry. The index may
//! lag behind the store in either direction: entries for blobs that no longer
//! exist are processed as no-ops.

mod memory;
mod redb_index;

pub use memory::MemoryDeletedBlobIndex;
pub use redb_index::RedbDeletedBlobIndex;

use blobvault_common::{BlobId, Error};

/// Error type for index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for IndexError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        Self::Index(e.to_string())
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Persistent set of soft-deleted blob ids
///
/// Adding an id twice and removing an absent id are both fine.
pub trait DeletedBlobIndex: Send + Sync {
    /// Record `id` as soft-deleted
    fn add(&self, id: &BlobId) -> IndexResult<()>;

    /// Forget `id`
    fn remove(&self, id: &BlobId) -> IndexResult<()>;

    /// Snapshot of all recorded ids; later changes are not reflected
    fn browse(&self) -> IndexResult<Vec<BlobId>>;

    /// Whether `id` is currently recorded
    fn contains(&self, id: &BlobId) -> IndexResult<bool> {
        Ok(self.browse()?.contains(id))
    }

    /// Number of recorded ids
    fn len(&self) -> IndexResult<usize> {
        Ok(self.browse()?.len())
    }

    fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }
}
