//! Per-blob handle cache
//!
//! At most one live [`Blob`] handle exists per id: the map holds weak
//! references, so a handle lives exactly as long as some task (or the small
//! ring of recently used handles) holds it. The handle owns the lock that
//! serializes all mutations of its blob, which means distinct ids never
//! contend with each other.
//!
//! Handles never trust their cached attributes blindly. A handle is stale when
//! created and again after any mutation, and readers reload attributes before
//! using a stale handle.

use crate::attributes::BlobAttributes;
use blobvault_client::ObjectStorageClient;
use blobvault_common::{BlobId, BlobMetrics, Error, Headers, Result};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::MutexGuard;

#[derive(Debug, Default)]
struct BlobState {
    headers: Headers,
    metrics: Option<BlobMetrics>,
    deleted: bool,
}

/// Handle to one stored blob
pub struct Blob {
    id: BlobId,
    content_key: String,
    client: Arc<dyn ObjectStorageClient>,
    lock: tokio::sync::Mutex<()>,
    state: RwLock<BlobState>,
    stale: AtomicBool,
}

impl Blob {
    fn new(id: BlobId, content_key: String, client: Arc<dyn ObjectStorageClient>) -> Self {
        Self {
            id,
            content_key,
            client,
            lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(BlobState::default()),
            stale: AtomicBool::new(true),
        }
    }

    pub const fn id(&self) -> &BlobId {
        &self.id
    }

    /// Headers as of the last refresh
    pub fn headers(&self) -> Headers {
        self.state.read().headers.clone()
    }

    /// Content metrics as of the last refresh
    pub fn metrics(&self) -> Option<BlobMetrics> {
        self.state.read().metrics.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.read().deleted
    }

    /// True if cached attributes must be reloaded before use
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Fetch the content object
    pub async fn content(&self) -> Result<Bytes> {
        self.client
            .get(&self.content_key)
            .await
            .map_err(|e| e.with_blob(&self.id))?
            .ok_or_else(|| Error::BlobNotFound(self.id.clone()))
    }

    /// Exclusive access to this blob's objects
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Adopt freshly loaded attributes and clear the stale flag
    pub(crate) fn refresh(&self, attributes: &BlobAttributes) {
        let mut state = self.state.write();
        state.headers.clone_from(&attributes.headers);
        state.metrics = Some(attributes.metrics.clone());
        state.deleted = attributes.deleted;
        drop(state);
        self.stale.store(false, Ordering::Release);
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("stale", &self.is_stale())
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups that found a live handle
    pub hits: AtomicU64,
    /// Lookups that had to create a handle
    pub misses: AtomicU64,
    /// Dead map entries removed
    pub pruned: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Get-or-create map from blob id to its live handle
pub struct BlobCache {
    entries: DashMap<BlobId, Weak<Blob>>,
    /// Strong references to recently used handles
    recent: Mutex<VecDeque<Arc<Blob>>>,
    retained: usize,
    stats: CacheStats,
}

impl BlobCache {
    pub fn new(retained: usize) -> Self {
        Self {
            entries: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(retained)),
            retained,
            stats: CacheStats::default(),
        }
    }

    /// The live handle for `id`, creating one if none exists
    pub fn get_or_create(
        &self,
        id: &BlobId,
        content_key: impl FnOnce() -> String,
        client: &Arc<dyn ObjectStorageClient>,
    ) -> Arc<Blob> {
        let blob = match self.entries.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(blob) = entry.get().upgrade() {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    blob
                } else {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    let blob = Arc::new(Blob::new(id.clone(), content_key(), Arc::clone(client)));
                    entry.insert(Arc::downgrade(&blob));
                    blob
                }
            }
            Entry::Vacant(entry) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let blob = Arc::new(Blob::new(id.clone(), content_key(), Arc::clone(client)));
                entry.insert(Arc::downgrade(&blob));
                blob
            }
        };
        self.retain(&blob);

        if self.entries.len() > self.retained.saturating_mul(2).max(64) {
            self.prune();
        }
        blob
    }

    fn retain(&self, blob: &Arc<Blob>) {
        if self.retained == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        if recent.back().is_some_and(|b| Arc::ptr_eq(b, blob)) {
            return;
        }
        recent.push_back(Arc::clone(blob));
        while recent.len() > self.retained {
            recent.pop_front();
        }
    }

    /// Mark the handle for `id` stale and forget it
    ///
    /// The next lookup builds a fresh handle, so a refresh still running on
    /// the old one cannot make it current again.
    pub fn invalidate(&self, id: &BlobId) {
        if let Some((_, weak)) = self.entries.remove(id) {
            if let Some(blob) = weak.upgrade() {
                blob.mark_stale();
            }
        }
        self.recent.lock().retain(|b| b.id() != id);
    }

    /// Drop map entries whose handles are gone
    pub fn prune(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        let removed = before.saturating_sub(self.entries.len());
        self.stats.pruned.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Release all retained handles
    pub fn clear(&self) {
        self.recent.lock().clear();
        self.prune();
    }

    /// Number of ids with a map entry (live or not yet pruned)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
