//! Tombstone index persisted in redb
//!
//! One table keyed by blob id; the value is the time the tombstone was
//! written (epoch millis), kept for operators inspecting the file.

use crate::{DeletedBlobIndex, IndexResult};
use blobvault_common::BlobId;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const DELETED_BLOBS: TableDefinition<&str, u64> = TableDefinition::new("deleted_blobs");

/// Durable tombstone index backed by a redb file
pub struct RedbDeletedBlobIndex {
    db: Database,
}

impl RedbDeletedBlobIndex {
    /// Open (or create) the index at the given path.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so read txns on a fresh file don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(DELETED_BLOBS)?;
        }
        write_txn.commit()?;

        debug!("Opened deleted blob index at {}", path.display());
        Ok(Self { db })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl DeletedBlobIndex for RedbDeletedBlobIndex {
    fn add(&self, id: &BlobId) -> IndexResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DELETED_BLOBS)?;
            table.insert(id.as_str(), now_millis())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, id: &BlobId) -> IndexResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DELETED_BLOBS)?;
            table.remove(id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn browse(&self) -> IndexResult<Vec<BlobId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELETED_BLOBS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push(BlobId::new(entry.0.value()));
        }
        Ok(result)
    }

    fn contains(&self, id: &BlobId) -> IndexResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELETED_BLOBS)?;
        Ok(table.get(id.as_str())?.is_some())
    }

    fn len(&self) -> IndexResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DELETED_BLOBS)?;
        Ok(usize::try_from(table.len()?).unwrap_or(usize::MAX))
    }
}
