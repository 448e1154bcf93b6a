//! Blobvault Client - Object storage clients
//!
//! The blob store only ever talks to remote storage through the
//! [`ObjectStorageClient`] trait: named objects that can be put, fetched,
//! deleted, copied server-side, assembled from staged blocks, and listed page
//! by page. Every call is a suspension point; concurrency comes from callers
//! issuing calls from many tasks, not from the client itself.

pub mod fs;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use blobvault_common::Result;
use bytes::Bytes;

pub use fs::FsObjectStorage;
pub use memory::{ClientOperation, MemoryObjectStorage};
pub use retry::{RetryPolicy, RetryingClient};

/// One page of a prefix listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys on this page, in ascending order
    pub keys: Vec<String>,
    /// Continuation marker; `None` when this is the last page
    pub next_marker: Option<String>,
}

/// Access to one container of a remote object store
#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    /// Container all keys are relative to
    fn container_name(&self) -> &str;

    /// Store an object in a single call
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch an object; `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Check whether an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete an object; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Server-side copy, returning once the destination is complete
    async fn copy(&self, source: &str, destination: &str) -> Result<()>;

    /// Upload one uncommitted block for `key`
    async fn stage_block(&self, key: &str, block_id: &str, data: Bytes) -> Result<()>;

    /// Atomically replace `key` with the concatenation of the given staged
    /// blocks, in order. Nothing is visible to readers before this call.
    async fn commit_block_list(&self, key: &str, block_ids: &[String]) -> Result<()>;

    /// List keys starting with `prefix` that sort after `marker`
    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        max_results: usize,
    ) -> Result<ListPage>;

    /// Create the container if it does not exist
    async fn create_container(&self) -> Result<()>;

    /// Delete the container and everything in it
    async fn delete_container(&self) -> Result<()>;

    /// Check whether the container exists
    async fn container_exists(&self) -> Result<bool>;
}

/// Cut one page out of `keys`, which must be sorted ascending
pub(crate) fn paginate<I, S>(
    keys: I,
    prefix: &str,
    marker: Option<&str>,
    max_results: usize,
) -> ListPage
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let max_results = max_results.max(1);
    let mut page = Vec::new();
    let mut more = false;

    for key in keys {
        let key = key.as_ref();
        if !key.starts_with(prefix) || marker.is_some_and(|m| key <= m) {
            continue;
        }
        if page.len() == max_results {
            more = true;
            break;
        }
        page.push(key.to_string());
    }

    let next_marker = if more { page.last().cloned() } else { None };
    ListPage {
        keys: page,
        next_marker,
    }
}
