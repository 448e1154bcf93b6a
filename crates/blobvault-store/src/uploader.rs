//! Chunked content upload
//!
//! Content is read into a single reusable buffer of `chunk_size` bytes. Each
//! full buffer is staged as one block; a short final buffer becomes the last
//! block. The object appears atomically when the block list is committed.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use blobvault_client::ObjectStorageClient;
use blobvault_common::{Error, Result, Sha1Calculator, StreamMetrics};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use uuid::Uuid;

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub metrics: StreamMetrics,
    pub block_count: usize,
}

/// Streams content into staged blocks
#[derive(Debug, Clone, Copy)]
pub struct ChunkedUploader {
    chunk_size: usize,
}

impl ChunkedUploader {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::invalid_argument("chunk size must be greater than zero"));
        }
        Ok(Self { chunk_size })
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Upload everything `reader` yields to `key`
    ///
    /// SHA-1 and size are computed over the same buffers that are staged.
    pub async fn upload<R>(
        &self,
        client: &dyn ObjectStorageClient,
        key: &str,
        reader: &mut R,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut digest = Sha1Calculator::new();
        let mut block_ids = Vec::new();

        loop {
            let filled = fill_buffer(reader, &mut buffer).await?;
            if filled == 0 {
                break;
            }
            let chunk = &buffer[..filled];
            digest.update(chunk);

            let block_id = new_block_id();
            client
                .stage_block(key, &block_id, Bytes::copy_from_slice(chunk))
                .await?;
            block_ids.push(block_id);

            if filled < self.chunk_size {
                break;
            }
        }

        client.commit_block_list(key, &block_ids).await?;
        let metrics = digest.finalize();
        debug!(
            "Uploaded {} bytes to {} in {} blocks",
            metrics.size,
            key,
            block_ids.len()
        );
        Ok(UploadOutcome {
            metrics,
            block_count: block_ids.len(),
        })
    }
}

/// Read until `buffer` is full or the reader is exhausted
async fn fill_buffer<R>(reader: &mut R, buffer: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Random 128-bit block id, base64 encoded
fn new_block_id() -> String {
    STANDARD.encode(Uuid::new_v4().as_bytes())
}
