//! Filesystem-backed object storage
//!
//! Each object is a file below `<root>/<container>/`, with `/` in keys mapping
//! to directories. Staged blocks live under a reserved `.blobvault/` directory
//! and are assembled into a temporary file that is renamed over the target on
//! commit, so readers never observe a partially written object.

use crate::{ListPage, ObjectStorageClient, paginate};
use async_trait::async_trait;
use blobvault_common::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory inside the container reserved for staging and temp files
const RESERVED_DIR: &str = ".blobvault";

/// Sorted keys of the listing in progress
#[derive(Debug)]
struct ListingSnapshot {
    prefix: String,
    keys: Arc<Vec<String>>,
}

/// Object storage on a local (or mounted) filesystem
///
/// A listing walks the tree once when it starts; continuation pages for the
/// same prefix are served from that snapshot.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    container_name: String,
    container_dir: PathBuf,
    listing: Arc<Mutex<Option<ListingSnapshot>>>,
}

impl FsObjectStorage {
    /// Create a client for `<root>/<container_name>`
    pub fn new(root: impl AsRef<Path>, container_name: impl Into<String>) -> Self {
        let container_name = container_name.into();
        let container_dir = root.as_ref().join(&container_name);
        Self {
            container_name,
            container_dir,
            listing: Arc::new(Mutex::new(None)),
        }
    }

    /// Directory holding the container's objects
    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// All keys that may match `prefix`, sorted
    async fn walk_sorted(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.container_dir.clone();
        // Only walk the deepest directory fully named by the prefix
        let start = prefix
            .rfind('/')
            .map_or_else(|| base.clone(), |idx| base.join(&prefix[..idx]));

        let mut keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            walk_keys(&base, &start, &mut keys).map(|()| keys)
        })
        .await
        .map_err(|e| Error::internal(format!("listing task failed: {e}")))??;

        keys.sort_unstable();
        Ok(keys)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.container_dir.join(key))
    }

    fn staging_dir(&self, key: &str) -> PathBuf {
        self.container_dir
            .join(RESERVED_DIR)
            .join("staging")
            .join(hex::encode(key))
    }

    fn temp_path(&self) -> PathBuf {
        self.container_dir
            .join(RESERVED_DIR)
            .join("tmp")
            .join(Uuid::new_v4().to_string())
    }

    async fn ensure_container(&self) -> Result<()> {
        match fs::metadata(&self.container_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(Error::ContainerNotFound(self.container_name.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::ContainerNotFound(self.container_name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a fully written temp file over `target`
    async fn publish(&self, temp: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(temp, target).await {
            let _ = fs::remove_file(temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn create_temp(&self) -> Result<(PathBuf, fs::File)> {
        let temp = self.temp_path();
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&temp).await?;
        Ok((temp, file))
    }

    /// Remove empty directories between `path` and the container root
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.container_dir || !dir.starts_with(&self.container_dir) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Reject keys that would escape the container or hit reserved paths
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("object key must not be empty"));
    }
    let path = Path::new(key);
    for component in path.components() {
        match component {
            Component::Normal(part) if part != RESERVED_DIR => {}
            _ => {
                return Err(Error::invalid_argument(format!("invalid object key: {key}")));
            }
        }
    }
    Ok(())
}

/// Collect all object keys below `start`, relative to `base`
fn walk_keys(base: &Path, start: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(start) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if start == base && entry.file_name() == RESERVED_DIR {
                continue;
            }
            walk_keys(base, &path, keys)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(base) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStorageClient for FsObjectStorage {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let target = self.object_path(key)?;
        self.ensure_container().await?;
        let (temp, mut file) = self.create_temp().await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        self.publish(&temp, &target).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(key)?;
        self.ensure_container().await?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        self.ensure_container().await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        self.ensure_container().await?;
        let _ = fs::remove_dir_all(self.staging_dir(key)).await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path).await;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let source_path = self.object_path(source)?;
        let target = self.object_path(destination)?;
        self.ensure_container().await?;
        let temp = self.temp_path();
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::copy(&source_path, &temp).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ObjectNotFound(source.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        self.publish(&temp, &target).await
    }

    async fn stage_block(&self, key: &str, block_id: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        self.ensure_container().await?;
        let dir = self.staging_dir(key);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(hex::encode(block_id)), &data).await?;
        Ok(())
    }

    async fn commit_block_list(&self, key: &str, block_ids: &[String]) -> Result<()> {
        let target = self.object_path(key)?;
        self.ensure_container().await?;
        let dir = self.staging_dir(key);

        let (temp, mut file) = self.create_temp().await?;
        for block_id in block_ids {
            let block = match fs::read(dir.join(hex::encode(block_id))).await {
                Ok(block) => block,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp).await;
                    return Err(if e.kind() == ErrorKind::NotFound {
                        Error::invalid_argument(format!(
                            "block {block_id} was not staged for {key}"
                        ))
                    } else {
                        e.into()
                    });
                }
            };
            file.write_all(&block).await?;
        }
        file.sync_all().await?;
        drop(file);

        self.publish(&temp, &target).await?;
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to clean staged blocks for {}: {}", key, e);
            }
        }
        debug!("Committed {} blocks to {}", block_ids.len(), key);
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        max_results: usize,
    ) -> Result<ListPage> {
        self.ensure_container().await?;
        let cached = marker.and_then(|_| {
            self.listing
                .lock()
                .as_ref()
                .filter(|snapshot| snapshot.prefix == prefix)
                .map(|snapshot| Arc::clone(&snapshot.keys))
        });
        let keys = match cached {
            Some(keys) => keys,
            None => {
                let keys = Arc::new(self.walk_sorted(prefix).await?);
                *self.listing.lock() = Some(ListingSnapshot {
                    prefix: prefix.to_string(),
                    keys: Arc::clone(&keys),
                });
                keys
            }
        };

        let start = marker.map_or(0, |m| keys.partition_point(|k| k.as_str() <= m));
        let page = paginate(&keys[start..], prefix, marker, max_results);
        if page.next_marker.is_none() {
            let mut listing = self.listing.lock();
            if listing
                .as_ref()
                .is_some_and(|snapshot| Arc::ptr_eq(&snapshot.keys, &keys))
            {
                *listing = None;
            }
        }
        Ok(page)
    }

    async fn create_container(&self) -> Result<()> {
        fs::create_dir_all(&self.container_dir).await?;
        Ok(())
    }

    async fn delete_container(&self) -> Result<()> {
        match fs::remove_dir_all(&self.container_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_exists(&self) -> Result<bool> {
        match fs::metadata(&self.container_dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
