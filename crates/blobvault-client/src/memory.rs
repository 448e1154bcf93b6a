//! In-memory object storage
//!
//! Behaves like a block-blob container: single-shot puts, staged blocks that
//! only become visible on commit, and paginated listing. Failures can be
//! injected per operation and key suffix to exercise error paths.

use crate::{ListPage, ObjectStorageClient, paginate};
use async_trait::async_trait;
use blobvault_common::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Client operations, used for fault injection and call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOperation {
    Put,
    Get,
    Exists,
    Delete,
    Copy,
    StageBlock,
    CommitBlockList,
    List,
}

#[derive(Debug)]
struct Fault {
    op: ClientOperation,
    key_suffix: String,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    block_count: usize,
}

#[derive(Debug, Default)]
struct Container {
    exists: bool,
    objects: BTreeMap<String, StoredObject>,
    /// key -> block id -> data
    staged: HashMap<String, HashMap<String, Bytes>>,
}

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct CallStats {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
    pub staged_blocks: AtomicU64,
    pub commits: AtomicU64,
    pub list_pages: AtomicU64,
}

/// Object storage held entirely in process memory
pub struct MemoryObjectStorage {
    container_name: String,
    container: RwLock<Container>,
    /// Upper bound on keys per listing page regardless of what callers ask for
    page_limit: Option<usize>,
    faults: Mutex<Vec<Fault>>,
    stats: CallStats,
}

impl MemoryObjectStorage {
    /// Create a client whose container does not exist yet
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            container: RwLock::new(Container::default()),
            page_limit: None,
            faults: Mutex::new(Vec::new()),
            stats: CallStats::default(),
        }
    }

    /// Cap the number of keys returned per listing page
    #[must_use]
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = Some(limit.max(1));
        self
    }

    /// Make the next `times` calls of `op` on keys ending with `key_suffix` fail
    /// with a retryable error
    pub fn fail_on(&self, op: ClientOperation, key_suffix: impl Into<String>, times: usize) {
        self.faults.lock().push(Fault {
            op,
            key_suffix: key_suffix.into(),
            remaining: times,
        });
    }

    /// Call counters
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Number of blocks the object at `key` was committed from
    pub fn committed_block_count(&self, key: &str) -> Option<usize> {
        self.container.read().objects.get(key).map(|o| o.block_count)
    }

    /// Number of committed objects
    pub fn object_count(&self) -> usize {
        self.container.read().objects.len()
    }

    /// Number of blocks staged for `key` and not yet committed
    pub fn staged_block_count(&self, key: &str) -> usize {
        self.container.read().staged.get(key).map_or(0, HashMap::len)
    }

    fn check_fault(&self, op: ClientOperation, key: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Some(fault) = faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0 && key.ends_with(&f.key_suffix))
        {
            fault.remaining -= 1;
            return Err(Error::ServiceUnavailable(format!(
                "injected {op:?} failure for {key}"
            )));
        }
        faults.retain(|f| f.remaining > 0);
        Ok(())
    }

    fn missing_container(&self) -> Error {
        Error::ContainerNotFound(self.container_name.clone())
    }
}

#[async_trait]
impl ObjectStorageClient for MemoryObjectStorage {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_fault(ClientOperation::Put, key)?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut container = self.container.write();
        if !container.exists {
            return Err(self.missing_container());
        }
        container.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                block_count: 1,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_fault(ClientOperation::Get, key)?;
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let container = self.container.read();
        if !container.exists {
            return Err(self.missing_container());
        }
        Ok(container.objects.get(key).map(|o| o.data.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_fault(ClientOperation::Exists, key)?;
        let container = self.container.read();
        if !container.exists {
            return Err(self.missing_container());
        }
        Ok(container.objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_fault(ClientOperation::Delete, key)?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let mut container = self.container.write();
        if !container.exists {
            return Err(self.missing_container());
        }
        container.staged.remove(key);
        Ok(container.objects.remove(key).is_some())
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        self.check_fault(ClientOperation::Copy, destination)?;
        let mut container = self.container.write();
        if !container.exists {
            return Err(self.missing_container());
        }
        let object = container
            .objects
            .get(source)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(source.to_string()))?;
        container.objects.insert(destination.to_string(), object);
        Ok(())
    }

    async fn stage_block(&self, key: &str, block_id: &str, data: Bytes) -> Result<()> {
        self.check_fault(ClientOperation::StageBlock, key)?;
        self.stats.staged_blocks.fetch_add(1, Ordering::Relaxed);
        let mut container = self.container.write();
        if !container.exists {
            return Err(self.missing_container());
        }
        container
            .staged
            .entry(key.to_string())
            .or_default()
            .insert(block_id.to_string(), data);
        Ok(())
    }

    async fn commit_block_list(&self, key: &str, block_ids: &[String]) -> Result<()> {
        self.check_fault(ClientOperation::CommitBlockList, key)?;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        let mut container = self.container.write();
        if !container.exists {
            return Err(self.missing_container());
        }

        let staged = container.staged.remove(key).unwrap_or_default();
        let mut assembled = BytesMut::new();
        for block_id in block_ids {
            let block = staged.get(block_id).ok_or_else(|| {
                Error::invalid_argument(format!("block {block_id} was not staged for {key}"))
            })?;
            assembled.extend_from_slice(block);
        }

        debug!("Committed {} blocks to {}", block_ids.len(), key);
        container.objects.insert(
            key.to_string(),
            StoredObject {
                data: assembled.freeze(),
                block_count: block_ids.len(),
            },
        );
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        max_results: usize,
    ) -> Result<ListPage> {
        self.check_fault(ClientOperation::List, prefix)?;
        self.stats.list_pages.fetch_add(1, Ordering::Relaxed);
        let container = self.container.read();
        if !container.exists {
            return Err(self.missing_container());
        }
        let max_results = self.page_limit.map_or(max_results, |l| l.min(max_results));
        Ok(paginate(container.objects.keys(), prefix, marker, max_results))
    }

    async fn create_container(&self) -> Result<()> {
        self.container.write().exists = true;
        Ok(())
    }

    async fn delete_container(&self) -> Result<()> {
        let mut container = self.container.write();
        *container = Container::default();
        Ok(())
    }

    async fn container_exists(&self) -> Result<bool> {
        Ok(self.container.read().exists)
    }
}
