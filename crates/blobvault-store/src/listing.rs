//! Blob id listing
//!
//! A [`BlobIdStream`] walks attribute objects under a prefix one page at a
//! time, holding only the continuation marker and the current page. It is
//! forward-only and may be dropped at any point.

use crate::location::blob_id_from_attribute_key;
use blobvault_client::ObjectStorageClient;
use blobvault_common::{BlobId, Error, Result};
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Lazy sequence of blob ids
pub struct BlobIdStream {
    client: Arc<dyn ObjectStorageClient>,
    prefix: String,
    page_size: usize,
    page_timeout: Duration,
    marker: Option<String>,
    buffer: VecDeque<BlobId>,
    exhausted: bool,
}

impl BlobIdStream {
    pub fn new(
        client: Arc<dyn ObjectStorageClient>,
        prefix: impl Into<String>,
        page_size: usize,
        page_timeout: Duration,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            page_size: page_size.max(1),
            page_timeout,
            marker: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next id, or `None` once the listing is exhausted
    pub async fn next(&mut self) -> Result<Option<BlobId>> {
        loop {
            if let Some(id) = self.buffer.pop_front() {
                return Ok(Some(id));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let page = tokio::time::timeout(
            self.page_timeout,
            self.client
                .list_page(&self.prefix, self.marker.as_deref(), self.page_size),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "listing {} did not complete within {:?}",
                self.prefix, self.page_timeout
            ))
        })??;

        debug!(
            "Listed {} keys under {} (more: {})",
            page.keys.len(),
            self.prefix,
            page.next_marker.is_some()
        );
        self.buffer
            .extend(page.keys.iter().filter_map(|key| blob_id_from_attribute_key(key)));
        self.exhausted = page.next_marker.is_none();
        self.marker = page.next_marker;
        Ok(())
    }

    /// Drain the remaining ids
    pub async fn collect(mut self) -> Result<Vec<BlobId>> {
        let mut ids = Vec::new();
        while let Some(id) = self.next().await? {
            ids.push(id);
        }
        Ok(ids)
    }

    /// Adapt into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Result<BlobId>> + Send {
        futures::stream::try_unfold(self, |mut ids| async move {
            Ok::<_, Error>(ids.next().await?.map(|id| (id, ids)))
        })
    }
}

impl std::fmt::Debug for BlobIdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobIdStream")
            .field("prefix", &self.prefix)
            .field("marker", &self.marker)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobvault_client::{ClientOperation, MemoryObjectStorage};
    use bytes::Bytes;
    use futures::TryStreamExt;
    use std::collections::HashSet;

    async fn populated(count: usize) -> Arc<MemoryObjectStorage> {
        let client = Arc::new(MemoryObjectStorage::new("test").with_page_limit(3));
        client.create_container().await.unwrap();
        for i in 0..count {
            let location = format!("vol-01/chap-0{}/id-{i:03}", i % 3);
            client
                .put(&format!("content/{location}.properties"), Bytes::new())
                .await
                .unwrap();
            client
                .put(&format!("content/{location}.bytes"), Bytes::new())
                .await
                .unwrap();
        }
        client.put("metadata.properties", Bytes::new()).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_each_id_exactly_once_across_pages() {
        let client = populated(10).await;
        let stream = BlobIdStream::new(client.clone(), "content/", 1000, Duration::from_secs(5));

        let ids = stream.collect().await.unwrap();
        assert_eq!(ids.len(), 10);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 10);
        assert!(ids.contains(&BlobId::new("id-007")));
        // 20 objects under content/ in pages of at most 3
        assert!(client.stats().list_pages.load(std::sync::atomic::Ordering::Relaxed) >= 7);
    }

    #[tokio::test]
    async fn test_early_drop_and_stream_adapter() {
        let client = populated(5).await;
        let mut ids = BlobIdStream::new(client.clone(), "content/", 2, Duration::from_secs(5));
        assert!(ids.next().await.unwrap().is_some());
        drop(ids);

        let all: Vec<BlobId> = BlobIdStream::new(client, "content/", 2, Duration::from_secs(5))
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_list_failure_surfaces() {
        let client = populated(2).await;
        client.fail_on(ClientOperation::List, "content/", 1);
        let mut ids = BlobIdStream::new(client, "content/", 10, Duration::from_secs(5));
        assert!(ids.next().await.unwrap_err().is_retryable());
    }
}
