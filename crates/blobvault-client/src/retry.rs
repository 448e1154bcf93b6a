//! Retrying client wrapper
//!
//! Wraps any [`ObjectStorageClient`] and retries calls failing with a
//! retryable error (timeouts, throttling, dropped connections) using capped
//! exponential backoff. Non-retryable errors are returned immediately.

use crate::{ListPage, ObjectStorageClient};
use async_trait::async_trait;
use blobvault_common::Result;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff settings for [`RetryingClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Client that retries transient failures of the wrapped client
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ObjectStorageClient> RetryingClient<C> {
    pub const fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped client
    pub const fn inner(&self) -> &C {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, operation: &str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "{} {} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, key, attempt, self.policy.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<C: ObjectStorageClient> ObjectStorageClient for RetryingClient<C> {
    fn container_name(&self) -> &str {
        self.inner.container_name()
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.run("put", key, || self.inner.put(key, data.clone()))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.run("get", key, || self.inner.get(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.run("exists", key, || self.inner.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.run("delete", key, || self.inner.delete(key)).await
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        self.run("copy", source, || self.inner.copy(source, destination))
            .await
    }

    async fn stage_block(&self, key: &str, block_id: &str, data: Bytes) -> Result<()> {
        self.run("stage_block", key, || {
            self.inner.stage_block(key, block_id, data.clone())
        })
        .await
    }

    async fn commit_block_list(&self, key: &str, block_ids: &[String]) -> Result<()> {
        self.run("commit_block_list", key, || {
            self.inner.commit_block_list(key, block_ids)
        })
        .await
    }

    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        max_results: usize,
    ) -> Result<ListPage> {
        self.run("list", prefix, || {
            self.inner.list_page(prefix, marker, max_results)
        })
        .await
    }

    async fn create_container(&self) -> Result<()> {
        let name = self.inner.container_name();
        self.run("create_container", name, || self.inner.create_container())
            .await
    }

    async fn delete_container(&self) -> Result<()> {
        let name = self.inner.container_name();
        self.run("delete_container", name, || self.inner.delete_container())
            .await
    }

    async fn container_exists(&self) -> Result<bool> {
        let name = self.inner.container_name();
        self.run("container_exists", name, || self.inner.container_exists())
            .await
    }
}
