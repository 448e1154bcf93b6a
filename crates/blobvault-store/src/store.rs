//! Blob store engine
//!
//! Maps logical blob operations onto pairs of objects in one container. All
//! mutations of a blob run under its handle's lock; operations on different
//! blobs proceed independently.

use crate::attributes::BlobAttributes;
use crate::cache::{Blob, BlobCache, CacheStats};
use crate::listing::BlobIdStream;
use crate::location::{
    BlobIdLocationResolver, CONTENT_PREFIX, attribute_key, content_key, direct_path_prefix,
};
use crate::metrics::MetricsStore;
use crate::properties::PropertiesFile;
use crate::uploader::ChunkedUploader;
use blobvault_client::ObjectStorageClient;
use blobvault_common::{
    BLOB_NAME_HEADER, BlobId, BlobMetrics, BlobStoreConfig, BlobStoreMetrics, Error, Headers,
    Result,
};
use blobvault_index::DeletedBlobIndex;
use chrono::Utc;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

/// Store-wide metadata object
pub const METADATA_KEY: &str = "metadata.properties";

const TYPE_KEY: &str = "type";
const CURRENT_VERSION: &str = "1";
const STORE_TYPE: &str = "blobvault";

/// Decides whether a soft-deleted blob is still referenced by its owner
pub trait UsageChecker: Send + Sync {
    fn test(&self, store: &BlobStore, id: &BlobId, blob_name: &str) -> bool;
}

impl<F> UsageChecker for F
where
    F: Fn(&BlobStore, &BlobId, &str) -> bool + Send + Sync,
{
    fn test(&self, store: &BlobStore, id: &BlobId, blob_name: &str) -> bool {
        self(store, id, blob_name)
    }
}

/// Lifecycle state of a [`BlobStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    New,
    Started,
    Stopped,
    Failed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Tombstones processed
    pub examined: usize,
    /// Soft-deleted blobs removed for good
    pub purged: usize,
    /// Content bytes freed by purging
    pub reclaimed_bytes: u64,
    /// Soft-deleted blobs restored because they are still in use
    pub undeleted: usize,
    /// Tombstones dropped because their blob is live again
    pub live: usize,
    /// Tombstones with no blob behind them
    pub absent: usize,
    /// Tombstones left in place after an error
    pub failed: usize,
}

enum Compacted {
    Purged(u64),
    Undeleted,
    Live,
    Absent,
}

/// Content-addressable blob store over a remote object store container
pub struct BlobStore {
    config: BlobStoreConfig,
    client: Arc<dyn ObjectStorageClient>,
    index: Arc<dyn DeletedBlobIndex>,
    resolver: Arc<dyn BlobIdLocationResolver>,
    uploader: ChunkedUploader,
    cache: BlobCache,
    metrics: MetricsStore,
    state: RwLock<StoreState>,
}

impl BlobStore {
    /// Validate the configuration and make sure the container exists
    pub async fn new(
        config: BlobStoreConfig,
        client: Arc<dyn ObjectStorageClient>,
        index: Arc<dyn DeletedBlobIndex>,
        resolver: Arc<dyn BlobIdLocationResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let uploader = ChunkedUploader::new(config.chunk_size)?;

        if !client.container_exists().await? {
            info!(
                "Creating container {} for blob store {}",
                client.container_name(),
                config.name
            );
            client.create_container().await?;
        }

        let metrics = MetricsStore::new(
            Arc::clone(&client),
            &config.node_id,
            config.metrics_flush_interval(),
        );
        Ok(Self {
            cache: BlobCache::new(config.cache_retained_handles),
            config,
            client,
            index,
            resolver,
            uploader,
            metrics,
            state: RwLock::new(StoreState::New),
        })
    }

    pub const fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    pub const fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Check the store metadata and start metrics collection
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            StoreState::Started => return Ok(()),
            StoreState::Failed => return Err(Error::NotStarted(StoreState::Failed.to_string())),
            StoreState::New | StoreState::Stopped => {}
        }

        if let Err(e) = self.check_metadata().await {
            *self.state.write() = StoreState::Failed;
            return Err(e);
        }
        self.metrics.start().await?;

        *self.state.write() = StoreState::Started;
        info!(
            "Started blob store {} on container {}",
            self.config.name,
            self.client.container_name()
        );
        Ok(())
    }

    async fn check_metadata(&self) -> Result<()> {
        let expected = format!("{STORE_TYPE}/{CURRENT_VERSION}");
        let mut metadata = PropertiesFile::new(Arc::clone(&self.client), METADATA_KEY);
        if metadata.load().await? {
            let found = metadata.get(TYPE_KEY).unwrap_or_default();
            if found != expected {
                error!(
                    "Blob store {} has unsupported type/version {:?}",
                    self.config.name, found
                );
                return Err(Error::VersionMismatch {
                    found: found.to_string(),
                    key: METADATA_KEY.to_string(),
                });
            }
        } else {
            info!("Initializing new blob store {}", self.config.name);
            metadata.set(TYPE_KEY, expected);
            metadata.store().await?;
        }
        Ok(())
    }

    /// Flush metrics and release cached handles
    pub async fn stop(&self) -> Result<()> {
        if self.state() != StoreState::Started {
            return Ok(());
        }
        *self.state.write() = StoreState::Stopped;
        self.cache.clear();
        self.metrics.stop().await?;
        info!("Stopped blob store {}", self.config.name);
        Ok(())
    }

    /// Delete the metrics snapshot and the whole container
    pub async fn remove(&self) -> Result<()> {
        if self.state() == StoreState::Started {
            return Err(Error::invalid_argument(format!(
                "blob store {} must be stopped before removal",
                self.config.name
            )));
        }
        self.metrics.remove().await?;
        self.client.delete_container().await?;
        info!("Removed blob store {}", self.config.name);
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        let state = self.state();
        if state == StoreState::Started {
            Ok(())
        } else {
            Err(Error::NotStarted(state.to_string()))
        }
    }

    fn content_key(&self, id: &BlobId) -> String {
        content_key(&self.resolver.location(id))
    }

    fn attribute_key(&self, id: &BlobId) -> String {
        attribute_key(&self.resolver.location(id))
    }

    fn handle(&self, id: &BlobId) -> Arc<Blob> {
        self.cache
            .get_or_create(id, || self.content_key(id), &self.client)
    }

    async fn load_attributes(&self, id: &BlobId) -> Result<Option<BlobAttributes>> {
        BlobAttributes::load(Arc::clone(&self.client), &self.attribute_key(id)).await
    }

    /// Store new content
    ///
    /// The `BlobStore.blob-name` header is required. Without `assigned_id` the
    /// id is derived from the headers by the location resolver.
    pub async fn create<R>(
        &self,
        headers: Headers,
        content: &mut R,
        assigned_id: Option<BlobId>,
    ) -> Result<Arc<Blob>>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.ensure_started()?;
        if !headers.contains_key(BLOB_NAME_HEADER) {
            return Err(Error::invalid_argument(format!(
                "missing {BLOB_NAME_HEADER} header"
            )));
        }
        let id = assigned_id.unwrap_or_else(|| self.resolver.from_headers(&headers));
        self.create_locked(&id, headers, content)
            .await
            .map_err(|e| e.with_blob(&id))
    }

    async fn create_locked<R>(
        &self,
        id: &BlobId,
        headers: Headers,
        content: &mut R,
    ) -> Result<Arc<Blob>>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let blob = self.handle(id);
        let _guard = blob.lock().await;

        // Overwriting a direct-path blob replaces its size in the totals
        let previous_size = if id.is_direct_path() {
            match self.load_attributes(id).await {
                Ok(previous) => previous.map(|a| a.metrics.content_size),
                Err(e) => {
                    warn!("Unable to load existing attributes of {}: {}", id, e);
                    None
                }
            }
        } else {
            None
        };

        let content_key = self.content_key(id);
        let attribute_key = self.attribute_key(id);
        let written = async {
            let outcome = self
                .uploader
                .upload(self.client.as_ref(), &content_key, content)
                .await?;
            let attributes = BlobAttributes::new(
                headers,
                BlobMetrics::new(Utc::now(), outcome.metrics.sha1, outcome.metrics.size),
            );
            attributes
                .store(Arc::clone(&self.client), &attribute_key)
                .await?;
            Ok::<_, Error>(attributes)
        }
        .await;

        match written {
            Ok(attributes) => {
                blob.refresh(&attributes);
                if let Some(size) = previous_size {
                    self.metrics.record_deletion(size);
                }
                self.metrics.record_addition(attributes.metrics.content_size);
                debug!(
                    "Created blob {} ({} bytes)",
                    id, attributes.metrics.content_size
                );
                Ok(Arc::clone(&blob))
            }
            Err(e) => {
                blob.mark_stale();
                let removed = self.remove_objects(id, &content_key, &attribute_key).await;
                if removed {
                    if let Some(size) = previous_size {
                        self.metrics.record_deletion(size);
                    }
                }
                Err(e)
            }
        }
    }

    /// Best-effort removal after a failed write; returns whether an attribute
    /// object was removed
    async fn remove_objects(&self, id: &BlobId, content_key: &str, attribute_key: &str) -> bool {
        if let Err(e) = self.client.delete(content_key).await {
            error!("Unable to clean up content of failed blob {}: {}", id, e);
        }
        match self.client.delete(attribute_key).await {
            Ok(existed) => existed,
            Err(e) => {
                error!("Unable to clean up attributes of failed blob {}: {}", id, e);
                false
            }
        }
    }

    /// Copy an existing blob server-side under a new id derived from `headers`
    pub async fn copy(&self, source: &BlobId, headers: Headers) -> Result<Arc<Blob>> {
        self.ensure_started()?;
        let source_attributes = self
            .load_attributes(source)
            .await
            .map_err(|e| e.with_blob(source))?
            .ok_or_else(|| Error::BlobNotFound(source.clone()))?;
        if source_attributes.deleted {
            warn!("Attempt to copy soft-deleted blob {}", source);
            return Err(Error::BlobNotFound(source.clone()));
        }

        let target = self.resolver.from_headers(&headers);
        self.copy_locked(source, &target, headers, &source_attributes.metrics)
            .await
            .map_err(|e| e.with_blob(&target))
    }

    async fn copy_locked(
        &self,
        source: &BlobId,
        target: &BlobId,
        headers: Headers,
        source_metrics: &BlobMetrics,
    ) -> Result<Arc<Blob>> {
        let blob = self.handle(target);
        let _guard = blob.lock().await;

        let content_key = self.content_key(target);
        let attribute_key = self.attribute_key(target);
        let timeout = self.config.copy_timeout();
        let written = async {
            tokio::time::timeout(
                timeout,
                self.client.copy(&self.content_key(source), &content_key),
            )
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "copy from {source} did not complete within {timeout:?}"
                ))
            })??;
            let attributes = BlobAttributes::new(
                headers,
                BlobMetrics::new(
                    Utc::now(),
                    source_metrics.sha1_hash.clone(),
                    source_metrics.content_size,
                ),
            );
            attributes
                .store(Arc::clone(&self.client), &attribute_key)
                .await?;
            Ok::<_, Error>(attributes)
        }
        .await;

        match written {
            Ok(attributes) => {
                blob.refresh(&attributes);
                self.metrics.record_addition(attributes.metrics.content_size);
                debug!("Copied blob {} to {}", source, target);
                Ok(Arc::clone(&blob))
            }
            Err(e) => {
                blob.mark_stale();
                self.remove_objects(target, &content_key, &attribute_key).await;
                Err(e)
            }
        }
    }

    /// Look up a blob; soft-deleted blobs only when `include_deleted`
    pub async fn get(&self, id: &BlobId, include_deleted: bool) -> Result<Option<Arc<Blob>>> {
        self.ensure_started()?;
        let blob = self.handle(id);

        if blob.is_stale() {
            let _guard = blob.lock().await;
            if blob.is_stale() {
                match self.load_attributes(id).await.map_err(|e| e.with_blob(id))? {
                    Some(attributes) => blob.refresh(&attributes),
                    None => {
                        warn!("Attempt to access non-existent blob {}", id);
                        return Ok(None);
                    }
                }
            }
        }

        if blob.is_deleted() && !include_deleted {
            warn!("Attempt to access soft-deleted blob {}", id);
            return Ok(None);
        }
        Ok(Some(blob))
    }

    /// Mark a blob deleted and record it for compaction
    ///
    /// Returns `false` if the blob does not exist or is already deleted.
    pub async fn soft_delete(&self, id: &BlobId, reason: &str) -> Result<bool> {
        self.ensure_started()?;
        self.soft_delete_locked(id, reason)
            .await
            .map_err(|e| e.with_blob(id))
    }

    async fn soft_delete_locked(&self, id: &BlobId, reason: &str) -> Result<bool> {
        let blob = self.handle(id);
        let _guard = blob.lock().await;

        let Some(mut attributes) = self.load_attributes(id).await? else {
            debug!("Attempt to soft-delete non-existent blob {}", id);
            return Ok(false);
        };
        if attributes.deleted {
            debug!("Attempt to soft-delete already deleted blob {}", id);
            return Ok(false);
        }

        // Tombstone first so a persisted deletion flag always has one
        blob.mark_stale();
        self.index.add(id)?;
        attributes.mark_deleted(reason);
        if let Err(e) = attributes
            .store(Arc::clone(&self.client), &self.attribute_key(id))
            .await
        {
            if let Err(index_err) = self.index.remove(id) {
                warn!("Unable to drop tombstone of blob {}: {}", id, index_err);
            }
            return Err(e);
        }
        debug!("Soft-deleted blob {}: {}", id, reason);
        Ok(true)
    }

    /// Remove both objects of a blob and its tombstone
    ///
    /// Returns `false` if neither object existed. The cached handle is
    /// invalidated even when the removal fails.
    pub async fn hard_delete(&self, id: &BlobId) -> Result<bool> {
        self.ensure_started()?;
        let result = self.hard_delete_objects(id).await;
        self.cache.invalidate(id);
        result.map_err(|e| e.with_blob(id))
    }

    async fn hard_delete_objects(&self, id: &BlobId) -> Result<bool> {
        let size = match self.load_attributes(id).await {
            Ok(attributes) => attributes.map(|a| a.metrics.content_size),
            Err(e) => {
                warn!("Unable to load attributes of {} before deletion: {}", id, e);
                None
            }
        };

        let content_existed = self.client.delete(&self.content_key(id)).await?;
        let attributes_existed = self.client.delete(&self.attribute_key(id)).await?;
        self.index.remove(id)?;

        let existed = content_existed || attributes_existed;
        if existed {
            if let Some(size) = size {
                self.metrics.record_deletion(size);
            }
            debug!("Hard-deleted blob {}", id);
        }
        Ok(existed)
    }

    /// Purge every tombstoned blob
    ///
    /// With a usage checker, blobs it still reports in use are undeleted
    /// instead. Failures are logged and leave the tombstone for the next pass.
    pub async fn compact(&self, checker: Option<&dyn UsageChecker>) -> Result<CompactionReport> {
        self.ensure_started()?;
        let ids = self.index.browse()?;
        info!(
            "Compacting blob store {}: {} tombstones",
            self.config.name,
            ids.len()
        );

        let mut report = CompactionReport::default();
        for id in ids {
            report.examined += 1;
            match self.compact_one(&id, checker).await {
                Ok(Compacted::Purged(size)) => {
                    report.purged += 1;
                    report.reclaimed_bytes += size;
                }
                Ok(Compacted::Undeleted) => report.undeleted += 1,
                Ok(Compacted::Live) => report.live += 1,
                Ok(Compacted::Absent) => report.absent += 1,
                Err(e) => {
                    warn!("Unable to compact blob {}: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Compaction of {} finished: {} purged ({} bytes), {} undeleted, {} failed",
            self.config.name, report.purged, report.reclaimed_bytes, report.undeleted, report.failed
        );
        Ok(report)
    }

    async fn compact_one(
        &self,
        id: &BlobId,
        checker: Option<&dyn UsageChecker>,
    ) -> Result<Compacted> {
        let Some(attributes) = self.load_attributes(id).await? else {
            self.hard_delete(id).await?;
            return Ok(Compacted::Absent);
        };
        if !attributes.deleted {
            self.index.remove(id)?;
            return Ok(Compacted::Live);
        }
        if checker.is_some() && self.undelete(checker, id, &attributes, false).await? {
            return Ok(Compacted::Undeleted);
        }
        self.hard_delete(id).await?;
        Ok(Compacted::Purged(attributes.metrics.content_size))
    }

    /// Whether the blob's attribute object can be loaded, deleted or not
    pub async fn exists(&self, id: &BlobId) -> Result<bool> {
        self.ensure_started()?;
        match self.load_attributes(id).await {
            Ok(attributes) => Ok(attributes.is_some()),
            Err(e) => {
                debug!("Unable to check existence of blob {}: {}", id, e);
                Ok(false)
            }
        }
    }

    /// Clear the deletion marker of a blob that is still in use
    ///
    /// Returns `true` if the blob was (or, on a dry run, would be) restored.
    pub async fn undelete(
        &self,
        checker: Option<&dyn UsageChecker>,
        id: &BlobId,
        attributes: &BlobAttributes,
        dry_run: bool,
    ) -> Result<bool> {
        self.ensure_started()?;
        let Some(checker) = checker else {
            return Ok(false);
        };
        let log_prefix = if dry_run { "[dry run] " } else { "" };
        let Some(blob_name) = attributes.blob_name() else {
            warn!("{}Cannot undelete blob {}: no blob name", log_prefix, id);
            return Ok(false);
        };
        if !attributes.deleted || !checker.test(self, id, blob_name) {
            return Ok(false);
        }

        warn!(
            "{}Undeleting blob {} ({}): still in use (deleted: {})",
            log_prefix,
            id,
            blob_name,
            attributes.deleted_reason.as_deref().unwrap_or("no reason")
        );
        if dry_run {
            return Ok(true);
        }

        let blob = self.handle(id);
        let _guard = blob.lock().await;
        let mut restored = attributes.clone();
        restored.clear_deleted();
        if let Err(e) = restored
            .store(Arc::clone(&self.client), &self.attribute_key(id))
            .await
        {
            error!("Unable to persist undelete of blob {}: {}", id, e);
            return Ok(false);
        }
        if let Err(e) = self.index.remove(id) {
            warn!("Unable to drop tombstone of undeleted blob {}: {}", id, e);
        }
        blob.mark_stale();
        Ok(true)
    }

    /// Current persisted attributes of a blob
    pub async fn get_blob_attributes(&self, id: &BlobId) -> Result<Option<BlobAttributes>> {
        self.ensure_started()?;
        self.load_attributes(id)
            .await
            .map_err(|e| e.with_blob(id))
    }

    /// Replace the persisted attributes of a blob
    pub async fn set_blob_attributes(&self, id: &BlobId, attributes: &BlobAttributes) -> Result<()> {
        self.ensure_started()?;
        let blob = self.handle(id);
        let _guard = blob.lock().await;
        attributes
            .store(Arc::clone(&self.client), &self.attribute_key(id))
            .await
            .map_err(|e| e.with_blob(id))?;
        blob.mark_stale();
        Ok(())
    }

    pub fn metrics(&self) -> Result<BlobStoreMetrics> {
        self.ensure_started()?;
        let mut metrics = self.metrics.metrics();
        metrics.writable = self.is_writable();
        Ok(metrics)
    }

    /// Persist the metrics snapshot now instead of waiting for the next flush
    pub async fn flush_metrics(&self) -> Result<()> {
        self.ensure_started()?;
        self.metrics.flush().await
    }

    pub fn is_writable(&self) -> bool {
        self.state() == StoreState::Started
    }

    /// Ids of all blobs, including soft-deleted ones
    pub fn blob_id_stream(&self) -> Result<BlobIdStream> {
        self.ensure_started()?;
        Ok(self.list_under(CONTENT_PREFIX.to_string()))
    }

    /// Ids of direct-path blobs whose name starts with `prefix`
    pub fn direct_path_blob_id_stream(&self, prefix: &str) -> Result<BlobIdStream> {
        self.ensure_started()?;
        Ok(self.list_under(direct_path_prefix(prefix)))
    }

    fn list_under(&self, prefix: String) -> BlobIdStream {
        BlobIdStream::new(
            Arc::clone(&self.client),
            prefix,
            self.config.list_page_size,
            self.config.list_timeout(),
        )
    }
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("name", &self.config.name)
            .field("container", &self.client.container_name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::DefaultLocationResolver;
    use blobvault_client::{ClientOperation, MemoryObjectStorage};
    use blobvault_common::{AvailableSpace, DIRECT_PATH_BLOB_HEADER, StreamMetrics};
    use blobvault_index::{IndexError, IndexResult, MemoryDeletedBlobIndex};
    use rand::RngCore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        client: Arc<MemoryObjectStorage>,
        index: Arc<MemoryDeletedBlobIndex>,
        store: BlobStore,
    }

    fn test_config() -> BlobStoreConfig {
        BlobStoreConfig {
            name: "test".to_string(),
            chunk_size: 16,
            list_page_size: 3,
            metrics_flush_interval_secs: 60,
            ..Default::default()
        }
    }

    /// Tombstone set whose first `failures` adds fail
    struct FailingIndex {
        inner: MemoryDeletedBlobIndex,
        failures: AtomicUsize,
    }

    impl FailingIndex {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryDeletedBlobIndex::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl DeletedBlobIndex for FailingIndex {
        fn add(&self, id: &BlobId) -> IndexResult<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(IndexError::Io(std::io::Error::other("disk full")));
            }
            self.inner.add(id)
        }

        fn remove(&self, id: &BlobId) -> IndexResult<()> {
            self.inner.remove(id)
        }

        fn browse(&self) -> IndexResult<Vec<BlobId>> {
            self.inner.browse()
        }
    }

    async fn open(client: Arc<MemoryObjectStorage>, index: Arc<dyn DeletedBlobIndex>) -> BlobStore {
        BlobStore::new(
            test_config(),
            client,
            index,
            Arc::new(DefaultLocationResolver::new()),
        )
        .await
        .unwrap()
    }

    async fn fixture() -> Fixture {
        let client = Arc::new(MemoryObjectStorage::new("blobs"));
        let index = Arc::new(MemoryDeletedBlobIndex::new());
        let store = open(Arc::clone(&client), index.clone()).await;
        store.start().await.unwrap();
        Fixture {
            client,
            index,
            store,
        }
    }

    fn named(name: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), name.to_string());
        headers
    }

    fn direct(name: &str) -> Headers {
        let mut headers = named(name);
        headers.insert(DIRECT_PATH_BLOB_HEADER.to_string(), "true".to_string());
        headers
    }

    async fn put(store: &BlobStore, name: &str, data: &[u8]) -> Arc<Blob> {
        store
            .create(named(name), &mut &data[..], None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let f = fixture().await;
        let blob = put(&f.store, "a.txt", b"hello").await;

        let metrics = blob.metrics().unwrap();
        assert_eq!(metrics.content_size, 5);
        assert_eq!(metrics.sha1_hash, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(blob.content().await.unwrap(), "hello");

        let fetched = f.store.get(blob.id(), false).await.unwrap().unwrap();
        assert_eq!(fetched.headers().get(BLOB_NAME_HEADER).unwrap(), "a.txt");

        let store_metrics = f.store.metrics().unwrap();
        assert_eq!(store_metrics.blob_count, 1);
        assert_eq!(store_metrics.total_size, 5);
        assert_eq!(store_metrics.available_space, AvailableSpace::Unbounded);
        assert!(store_metrics.writable);
    }

    #[tokio::test]
    async fn test_round_trip_random_content() {
        let f = fixture().await;
        for size in [0usize, 1, 15, 16, 17, 100] {
            let mut data = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut data);
            let blob = put(&f.store, "r.bin", &data).await;

            let fetched = f.store.get(blob.id(), false).await.unwrap().unwrap();
            assert_eq!(fetched.content().await.unwrap(), data);
            let metrics = fetched.metrics().unwrap();
            assert_eq!(StreamMetrics::new(metrics.content_size, metrics.sha1_hash), StreamMetrics::compute(&data));

            let location = DefaultLocationResolver::new().location(blob.id());
            assert_eq!(
                f.client.committed_block_count(&content_key(&location)),
                Some(size.div_ceil(16))
            );
        }
    }

    #[tokio::test]
    async fn test_blob_name_header_required() {
        let f = fixture().await;
        let err = f
            .store
            .create(Headers::new(), &mut &b"x"[..], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_get_missing_blob() {
        let f = fixture().await;
        assert!(f.store.get(&BlobId::random(), true).await.unwrap().is_none());
        assert!(!f.store.exists(&BlobId::random()).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent_and_hides_blob() {
        let f = fixture().await;
        let id = put(&f.store, "a.txt", b"hello").await.id().clone();

        assert!(f.store.soft_delete(&id, "test").await.unwrap());
        assert!(!f.store.soft_delete(&id, "test").await.unwrap());
        assert!(!f.store.soft_delete(&BlobId::random(), "test").await.unwrap());

        assert!(f.store.get(&id, false).await.unwrap().is_none());
        let deleted = f.store.get(&id, true).await.unwrap().unwrap();
        assert!(deleted.is_deleted());
        assert!(f.store.exists(&id).await.unwrap());
        assert_eq!(f.index.browse().unwrap(), vec![id.clone()]);

        let attributes = f.store.get_blob_attributes(&id).await.unwrap().unwrap();
        assert_eq!(attributes.deleted_reason.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn test_hard_delete() {
        let f = fixture().await;
        let id = put(&f.store, "a.txt", b"hello").await.id().clone();

        assert!(f.store.hard_delete(&id).await.unwrap());
        assert!(!f.store.exists(&id).await.unwrap());
        assert!(f.store.get(&id, true).await.unwrap().is_none());
        let location = DefaultLocationResolver::new().location(&id);
        assert!(!f.client.exists(&content_key(&location)).await.unwrap());
        assert_eq!(f.store.metrics().unwrap().total_size, 0);

        // Absent blobs are safe to delete and report false
        assert!(!f.store.hard_delete(&id).await.unwrap());
        assert!(!f.store.hard_delete(&BlobId::random()).await.unwrap());
        assert_eq!(f.store.metrics().unwrap().blob_count, 0);
    }

    #[tokio::test]
    async fn test_compaction_purges_tombstoned_blobs() {
        let f = fixture().await;
        let keep = put(&f.store, "keep", b"keep me").await.id().clone();
        let a = put(&f.store, "a", b"0123456789").await.id().clone();
        let b = put(&f.store, "b", b"abc").await.id().clone();
        f.store.soft_delete(&a, "gc").await.unwrap();
        f.store.soft_delete(&b, "gc").await.unwrap();
        // Tombstone for a blob that no longer exists
        f.index.add(&BlobId::random()).unwrap();

        let before = f.store.metrics().unwrap().total_size;
        let report = f.store.compact(None).await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.purged, 2);
        assert_eq!(report.absent, 1);
        assert_eq!(report.reclaimed_bytes, 13);

        assert!(f.index.is_empty().unwrap());
        assert!(!f.store.exists(&a).await.unwrap());
        assert!(!f.store.exists(&b).await.unwrap());
        assert!(f.store.exists(&keep).await.unwrap());
        let resolver = DefaultLocationResolver::new();
        for id in [&a, &b] {
            let location = resolver.location(id);
            assert!(!f.client.exists(&content_key(&location)).await.unwrap());
            assert!(!f.client.exists(&attribute_key(&location)).await.unwrap());
        }
        let after = f.store.metrics().unwrap();
        assert_eq!(before - after.total_size, 13);
        assert_eq!(after.blob_count, 1);
    }

    #[tokio::test]
    async fn test_soft_delete_recovers_from_tombstone_failure() {
        let client = Arc::new(MemoryObjectStorage::new("blobs"));
        let index = Arc::new(FailingIndex::new(1));
        let store = open(Arc::clone(&client), index.clone()).await;
        store.start().await.unwrap();
        let blob = put(&store, "a.txt", b"hello").await;
        let id = blob.id().clone();

        let err = store.soft_delete(&id, "gc").await.unwrap_err();
        assert_eq!(err.blob_id(), Some(&id));
        assert!(err.to_string().contains("disk full"));
        assert!(blob.is_stale());

        // Nothing was persisted, so the blob stays live
        assert!(store.get(&id, false).await.unwrap().is_some());
        assert!(!store.get_blob_attributes(&id).await.unwrap().unwrap().deleted);
        assert!(index.is_empty().unwrap());

        assert!(store.soft_delete(&id, "gc").await.unwrap());
        assert_eq!(index.browse().unwrap(), vec![id.clone()]);
        let report = store.compact(None).await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_drops_tombstone_when_flag_write_fails() {
        let f = fixture().await;
        let blob = put(&f.store, "a.txt", b"hello").await;
        let id = blob.id().clone();
        let location = DefaultLocationResolver::new().location(&id);
        f.client
            .fail_on(ClientOperation::Put, attribute_key(&location), 1);

        assert!(f.store.soft_delete(&id, "gc").await.is_err());
        assert!(blob.is_stale());
        assert!(f.index.is_empty().unwrap());
        assert!(f.store.get(&id, false).await.unwrap().is_some());

        assert!(f.store.soft_delete(&id, "gc").await.unwrap());
        assert!(f.index.contains(&id).unwrap());
    }

    #[tokio::test]
    async fn test_failed_hard_delete_invalidates_handle() {
        let f = fixture().await;
        let id = put(&f.store, "a.txt", b"hello").await.id().clone();
        f.store.soft_delete(&id, "gc").await.unwrap();
        let blob = f.store.get(&id, true).await.unwrap().unwrap();
        assert!(!blob.is_stale());

        let location = DefaultLocationResolver::new().location(&id);
        f.client
            .fail_on(ClientOperation::Delete, content_key(&location), 1);
        let err = f.store.hard_delete(&id).await.unwrap_err();
        assert_eq!(err.blob_id(), Some(&id));
        assert!(blob.is_stale());
        assert!(f.index.contains(&id).unwrap());
        assert_eq!(f.store.metrics().unwrap().blob_count, 1);
    }

    #[tokio::test]
    async fn test_hard_delete_without_attributes_keeps_totals() {
        let f = fixture().await;
        let id = put(&f.store, "a.txt", b"hello").await.id().clone();
        let location = DefaultLocationResolver::new().location(&id);
        f.client
            .fail_on(ClientOperation::Get, attribute_key(&location), 1);

        assert!(f.store.hard_delete(&id).await.unwrap());
        assert!(!f.client.exists(&content_key(&location)).await.unwrap());
        assert!(!f.client.exists(&attribute_key(&location)).await.unwrap());
        // The size was unknown, so nothing is subtracted
        let metrics = f.store.metrics().unwrap();
        assert_eq!(metrics.blob_count, 1);
        assert_eq!(metrics.total_size, 5);
    }

    #[tokio::test]
    async fn test_late_refresh_cannot_revive_hard_deleted_blob() {
        let f = fixture().await;
        let id = put(&f.store, "a.txt", b"hello").await.id().clone();
        let blob = f.store.get(&id, false).await.unwrap().unwrap();
        let attributes = f.store.get_blob_attributes(&id).await.unwrap().unwrap();

        assert!(f.store.hard_delete(&id).await.unwrap());
        assert!(blob.is_stale());
        // A get that loaded attributes before the deletion finishes afterwards
        blob.refresh(&attributes);

        assert!(f.store.get(&id, true).await.unwrap().is_none());
        let fresh = f.store.handle(&id);
        assert!(!Arc::ptr_eq(&blob, &fresh));
    }

    #[tokio::test]
    async fn test_compaction_undeletes_blobs_in_use() {
        let f = fixture().await;
        let used = put(&f.store, "used", b"1").await.id().clone();
        let unused = put(&f.store, "unused", b"2").await.id().clone();
        f.store.soft_delete(&used, "gc").await.unwrap();
        f.store.soft_delete(&unused, "gc").await.unwrap();

        let checker = |_: &BlobStore, _: &BlobId, name: &str| name == "used";
        let report = f.store.compact(Some(&checker as &dyn UsageChecker)).await.unwrap();
        assert_eq!(report.undeleted, 1);
        assert_eq!(report.purged, 1);

        let restored = f.store.get(&used, false).await.unwrap().unwrap();
        assert!(!restored.is_deleted());
        assert!(!f.store.exists(&unused).await.unwrap());
        assert!(f.index.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_compaction_keeps_overwritten_direct_path_blob() {
        let f = fixture().await;
        let id = f
            .store
            .create(direct("reports/today"), &mut &b"old"[..], None)
            .await
            .unwrap()
            .id()
            .clone();
        f.store.soft_delete(&id, "replaced").await.unwrap();
        f.store
            .create(direct("reports/today"), &mut &b"newer"[..], None)
            .await
            .unwrap();

        let report = f.store.compact(None).await.unwrap();
        assert_eq!(report.live, 1);
        let blob = f.store.get(&id, false).await.unwrap().unwrap();
        assert_eq!(blob.content().await.unwrap(), "newer");
        assert!(f.index.is_empty().unwrap());

        let metrics = f.store.metrics().unwrap();
        assert_eq!(metrics.blob_count, 1);
        assert_eq!(metrics.total_size, 5);
    }

    #[tokio::test]
    async fn test_undelete() {
        let f = fixture().await;
        let id = put(&f.store, "a.txt", b"hello").await.id().clone();
        f.store.soft_delete(&id, "gc").await.unwrap();
        let attributes = f.store.get_blob_attributes(&id).await.unwrap().unwrap();

        let always: &dyn UsageChecker = &|_: &BlobStore, _: &BlobId, _: &str| true;
        let never: &dyn UsageChecker = &|_: &BlobStore, _: &BlobId, _: &str| false;

        assert!(!f.store.undelete(None, &id, &attributes, false).await.unwrap());
        assert!(!f.store.undelete(Some(never), &id, &attributes, false).await.unwrap());

        // Dry run reports success without persisting
        assert!(f.store.undelete(Some(always), &id, &attributes, true).await.unwrap());
        assert!(f.store.get(&id, false).await.unwrap().is_none());

        assert!(f.store.undelete(Some(always), &id, &attributes, false).await.unwrap());
        assert!(f.store.get(&id, false).await.unwrap().is_some());
        assert!(f.index.is_empty().unwrap());

        // Missing blob name header
        let mut nameless = attributes.clone();
        nameless.headers.clear();
        assert!(!f.store.undelete(Some(always), &id, &nameless, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy() {
        let f = fixture().await;
        let source = put(&f.store, "src", b"copy me").await;

        let copy = f.store.copy(source.id(), named("dst")).await.unwrap();
        assert_ne!(copy.id(), source.id());
        assert_eq!(copy.content().await.unwrap(), "copy me");
        assert_eq!(
            copy.metrics().unwrap().sha1_hash,
            source.metrics().unwrap().sha1_hash
        );
        assert_eq!(f.store.metrics().unwrap().blob_count, 2);

        let err = f.store.copy(&BlobId::random(), named("x")).await.unwrap_err();
        assert!(matches!(err, Error::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn test_copy_rejects_soft_deleted_source() {
        let f = fixture().await;
        let id = put(&f.store, "src", b"copy me").await.id().clone();
        f.store.soft_delete(&id, "gc").await.unwrap();

        let err = f.store.copy(&id, named("dst")).await.unwrap_err();
        assert!(matches!(err, Error::BlobNotFound(ref missing) if *missing == id));
        assert_eq!(f.store.metrics().unwrap().blob_count, 1);
        let ids = f.store.blob_id_stream().unwrap().collect().await.unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[tokio::test]
    async fn test_failed_attribute_write_cleans_up() {
        let f = fixture().await;
        let id = BlobId::random();
        let location = DefaultLocationResolver::new().location(&id);
        f.client
            .fail_on(ClientOperation::Put, attribute_key(&location), 1);

        let err = f
            .store
            .create(named("a.txt"), &mut &b"hello"[..], Some(id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.blob_id(), Some(&id));
        assert!(!f.store.exists(&id).await.unwrap());
        assert!(!f.client.exists(&content_key(&location)).await.unwrap());
        assert_eq!(f.store.metrics().unwrap().blob_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_of_same_id_serialize() {
        let f = Arc::new(fixture().await);
        let id = BlobId::direct_path("shared/blob");

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let f = Arc::clone(&f);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let data = vec![i; 40 + usize::from(i)];
                f.store
                    .create(direct("shared/blob"), &mut data.as_slice(), Some(id))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let blob = f.store.get(&id, false).await.unwrap().unwrap();
        let content = blob.content().await.unwrap();
        let metrics = blob.metrics().unwrap();
        // Content and attributes come from the same writer
        assert_eq!(StreamMetrics::compute(&content).sha1, metrics.sha1_hash);
        assert_eq!(content.len() as u64, metrics.content_size);

        let store_metrics = f.store.metrics().unwrap();
        assert_eq!(store_metrics.blob_count, 1);
        assert_eq!(store_metrics.total_size, metrics.content_size);
    }

    #[tokio::test]
    async fn test_listing_yields_each_id_once() {
        let f = fixture().await;
        let mut expected = HashSet::new();
        for i in 0..10 {
            expected.insert(put(&f.store, &format!("b{i}"), b"x").await.id().clone());
        }
        let deleted = put(&f.store, "deleted", b"x").await.id().clone();
        f.store.soft_delete(&deleted, "gc").await.unwrap();
        expected.insert(deleted);

        let ids = f.store.blob_id_stream().unwrap().collect().await.unwrap();
        assert_eq!(ids.len(), expected.len());
        assert_eq!(ids.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_direct_path_listing_honours_prefix() {
        let f = fixture().await;
        for name in ["health/a", "health/b", "other/c"] {
            f.store
                .create(direct(name), &mut &b"x"[..], None)
                .await
                .unwrap();
        }
        put(&f.store, "not-direct", b"x").await;

        let mut ids = f
            .store
            .direct_path_blob_id_stream("health/")
            .unwrap()
            .collect()
            .await
            .unwrap();
        ids.sort();
        assert_eq!(
            ids,
            vec![BlobId::direct_path("health/a"), BlobId::direct_path("health/b")]
        );
        assert_eq!(
            f.store
                .direct_path_blob_id_stream("")
                .unwrap()
                .collect()
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_direct_path_overwrite_replaces_size() {
        let f = fixture().await;
        f.store
            .create(direct("a.txt"), &mut &b"hello"[..], None)
            .await
            .unwrap();
        f.store
            .create(direct("a.txt"), &mut &b"hello, world"[..], None)
            .await
            .unwrap();

        let metrics = f.store.metrics().unwrap();
        assert_eq!(metrics.blob_count, 1);
        assert_eq!(metrics.total_size, 12);
    }

    #[tokio::test]
    async fn test_direct_path_overwrite_with_unreadable_attributes() {
        let f = fixture().await;
        f.store
            .create(direct("a.txt"), &mut &b"hello"[..], None)
            .await
            .unwrap();
        let id = BlobId::direct_path("a.txt");
        let location = DefaultLocationResolver::new().location(&id);
        f.client
            .fail_on(ClientOperation::Get, attribute_key(&location), 1);

        let blob = f
            .store
            .create(direct("a.txt"), &mut &b"hello, world"[..], None)
            .await
            .unwrap();
        assert_eq!(blob.content().await.unwrap(), "hello, world");

        // The old size could not be read, so only the addition is counted
        let metrics = f.store.metrics().unwrap();
        assert_eq!(metrics.blob_count, 2);
        assert_eq!(metrics.total_size, 17);
    }

    #[tokio::test]
    async fn test_metrics_restored_after_restart() {
        let f = fixture().await;
        put(&f.store, "a", b"hello").await;
        put(&f.store, "b", b"world!").await;
        f.store.stop().await.unwrap();

        let reopened = open(Arc::clone(&f.client), f.index.clone()).await;
        reopened.start().await.unwrap();
        let metrics = reopened.metrics().unwrap();
        assert_eq!(metrics.blob_count, 2);
        assert_eq!(metrics.total_size, 11);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let client = Arc::new(MemoryObjectStorage::new("blobs"));
        client.create_container().await.unwrap();
        let mut metadata = PropertiesFile::new(client.clone(), METADATA_KEY);
        metadata.set("type", "blobvault/2");
        metadata.store().await.unwrap();

        let store = open(client, Arc::new(MemoryDeletedBlobIndex::new())).await;
        let err = store.start().await.unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        assert_eq!(store.state(), StoreState::Failed);
        assert!(matches!(store.start().await.unwrap_err(), Error::NotStarted(_)));
    }

    #[tokio::test]
    async fn test_first_start_writes_metadata() {
        let f = fixture().await;
        let mut metadata = PropertiesFile::new(f.client.clone(), METADATA_KEY);
        assert!(metadata.load().await.unwrap());
        assert_eq!(metadata.get("type"), Some("blobvault/1"));
    }

    #[tokio::test]
    async fn test_operations_require_started_store() {
        let client = Arc::new(MemoryObjectStorage::new("blobs"));
        let store = open(client.clone(), Arc::new(MemoryDeletedBlobIndex::new())).await;
        assert!(client.container_exists().await.unwrap());

        let id = BlobId::random();
        assert!(matches!(store.get(&id, false).await, Err(Error::NotStarted(_))));
        assert!(matches!(
            store.create(named("a"), &mut &b"x"[..], None).await,
            Err(Error::NotStarted(_))
        ));
        assert!(matches!(store.metrics(), Err(Error::NotStarted(_))));
        assert!(store.blob_id_stream().is_err());
        assert!(!store.is_writable());

        store.start().await.unwrap();
        store.stop().await.unwrap();
        assert!(matches!(store.soft_delete(&id, "x").await, Err(Error::NotStarted(_))));
        assert_eq!(store.state(), StoreState::Stopped);
    }

    #[tokio::test]
    async fn test_remove_requires_stopped_store() {
        let f = fixture().await;
        assert!(f.store.remove().await.is_err());
        f.store.stop().await.unwrap();
        f.store.remove().await.unwrap();
        assert!(!f.client.container_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_set_blob_attributes_invalidates_handle() {
        let f = fixture().await;
        let blob = put(&f.store, "a.txt", b"hello").await;
        let mut attributes = f.store.get_blob_attributes(blob.id()).await.unwrap().unwrap();
        attributes
            .headers
            .insert("BlobStore.content-type".to_string(), "text/plain".to_string());

        f.store.set_blob_attributes(blob.id(), &attributes).await.unwrap();
        assert!(blob.is_stale());
        let fetched = f.store.get(blob.id(), false).await.unwrap().unwrap();
        assert_eq!(
            fetched.headers().get("BlobStore.content-type").map(String::as_str),
            Some("text/plain")
        );
    }
}
