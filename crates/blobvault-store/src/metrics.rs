//! Running blob store metrics
//!
//! Blob count and total content size are kept in atomics and written to a
//! per-node snapshot object by a background flush loop. On start the totals
//! are restored from that snapshot.

use crate::properties::PropertiesFile;
use blobvault_client::ObjectStorageClient;
use blobvault_common::{AvailableSpace, BlobStoreMetrics, Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const METRICS_SUFFIX: &str = "-metrics.properties";
const BLOB_COUNT_KEY: &str = "blobCount";
const TOTAL_SIZE_KEY: &str = "totalSize";

#[derive(Debug, Default)]
struct Totals {
    blob_count: AtomicI64,
    total_size: AtomicI64,
    dirty: AtomicBool,
}

impl Totals {
    fn snapshot(&self) -> (u64, u64) {
        let count = self.blob_count.load(Ordering::Relaxed).max(0);
        let size = self.total_size.load(Ordering::Relaxed).max(0);
        (count.unsigned_abs(), size.unsigned_abs())
    }
}

struct FlushTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Accumulates blob count and total size and persists them periodically
pub struct MetricsStore {
    client: Arc<dyn ObjectStorageClient>,
    key: String,
    flush_interval: Duration,
    totals: Arc<Totals>,
    task: Mutex<Option<FlushTask>>,
}

impl MetricsStore {
    pub fn new(
        client: Arc<dyn ObjectStorageClient>,
        node_id: &str,
        flush_interval: Duration,
    ) -> Self {
        Self {
            client,
            key: format!("{node_id}{METRICS_SUFFIX}"),
            flush_interval,
            totals: Arc::new(Totals::default()),
            task: Mutex::new(None),
        }
    }

    /// Key of the snapshot object
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Restore totals from the snapshot and start the flush loop
    pub async fn start(&self) -> Result<()> {
        let mut file = PropertiesFile::new(Arc::clone(&self.client), &self.key);
        if file.load().await? {
            let count = parse_total(&file, BLOB_COUNT_KEY)?;
            let size = parse_total(&file, TOTAL_SIZE_KEY)?;
            self.totals.blob_count.store(count, Ordering::Relaxed);
            self.totals.total_size.store(size, Ordering::Relaxed);
            info!("Restored metrics from {}: {} blobs, {} bytes", self.key, count, size);
        } else {
            debug!("No metrics snapshot at {}, starting from zero", self.key);
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let client = Arc::clone(&self.client);
        let key = self.key.clone();
        let totals = Arc::clone(&self.totals);
        let period = self.flush_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if totals.dirty.swap(false, Ordering::AcqRel) {
                            if let Err(e) = write_snapshot(&client, &key, &totals).await {
                                totals.dirty.store(true, Ordering::Release);
                                warn!("Failed to flush metrics to {}: {}", key, e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Metrics flush loop for {} stopped", key);
        });

        let previous = self.task.lock().replace(FlushTask {
            shutdown_tx,
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        Ok(())
    }

    /// Stop the flush loop and write a final snapshot
    pub async fn stop(&self) -> Result<()> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(()).await;
            if let Err(e) = task.handle.await {
                error!("Metrics flush loop for {} failed: {}", self.key, e);
            }
        }
        self.totals.dirty.store(false, Ordering::Release);
        write_snapshot(&self.client, &self.key, &self.totals).await
    }

    /// Write the current totals now
    pub async fn flush(&self) -> Result<()> {
        self.totals.dirty.store(false, Ordering::Release);
        write_snapshot(&self.client, &self.key, &self.totals).await
    }

    pub fn record_addition(&self, size: u64) {
        self.totals.blob_count.fetch_add(1, Ordering::Relaxed);
        self.totals
            .total_size
            .fetch_add(i64::try_from(size).unwrap_or(i64::MAX), Ordering::Relaxed);
        self.totals.dirty.store(true, Ordering::Release);
    }

    pub fn record_deletion(&self, size: u64) {
        self.totals.blob_count.fetch_sub(1, Ordering::Relaxed);
        self.totals
            .total_size
            .fetch_sub(i64::try_from(size).unwrap_or(i64::MAX), Ordering::Relaxed);
        self.totals.dirty.store(true, Ordering::Release);
    }

    /// Current totals; cloud containers have no observable capacity limit
    pub fn metrics(&self) -> BlobStoreMetrics {
        let (blob_count, total_size) = self.totals.snapshot();
        BlobStoreMetrics {
            blob_count,
            total_size,
            available_space: AvailableSpace::Unbounded,
            writable: true,
        }
    }

    /// Delete the snapshot object
    pub async fn remove(&self) -> Result<()> {
        self.client.delete(&self.key).await.map(|_| ())
    }
}

fn parse_total(file: &PropertiesFile, name: &str) -> Result<i64> {
    file.get(name).map_or(Ok(0), |value| {
        value.trim().parse::<i64>().map_err(|e| Error::Properties {
            key: file.key().to_string(),
            reason: format!("bad {name}: {e}"),
        })
    })
}

async fn write_snapshot(
    client: &Arc<dyn ObjectStorageClient>,
    key: &str,
    totals: &Totals,
) -> Result<()> {
    let (count, size) = totals.snapshot();
    let mut file = PropertiesFile::new(Arc::clone(client), key);
    file.set(BLOB_COUNT_KEY, count.to_string());
    file.set(TOTAL_SIZE_KEY, size.to_string());
    file.store().await
}
