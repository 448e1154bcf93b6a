//! In-memory tombstone index

use crate::{DeletedBlobIndex, IndexResult};
use blobvault_common::BlobId;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Index that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryDeletedBlobIndex {
    ids: RwLock<BTreeSet<BlobId>>,
}

impl MemoryDeletedBlobIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeletedBlobIndex for MemoryDeletedBlobIndex {
    fn add(&self, id: &BlobId) -> IndexResult<()> {
        self.ids.write().insert(id.clone());
        Ok(())
    }

    fn remove(&self, id: &BlobId) -> IndexResult<()> {
        self.ids.write().remove(id);
        Ok(())
    }

    fn browse(&self) -> IndexResult<Vec<BlobId>> {
        Ok(self.ids.read().iter().cloned().collect())
    }

    fn contains(&self, id: &BlobId) -> IndexResult<bool> {
        Ok(self.ids.read().contains(id))
    }

    fn len(&self) -> IndexResult<usize> {
        Ok(self.ids.read().len())
    }
}
