//! Checksum utilities for Blobvault
//!
//! Content digests are computed while the data streams through, so that no
//! second pass over the payload is ever needed.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Size and SHA-1 of a stream of bytes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Number of bytes seen
    pub size: u64,
    /// Lowercase hex SHA-1
    pub sha1: String,
}

impl StreamMetrics {
    #[must_use]
    pub fn new(size: u64, sha1: impl Into<String>) -> Self {
        Self {
            size,
            sha1: sha1.into(),
        }
    }

    /// Compute metrics for an in-memory buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut calc = Sha1Calculator::new();
        calc.update(data);
        calc.finalize()
    }
}

/// Streaming SHA-1 and byte counter
#[derive(Clone, Default)]
pub struct Sha1Calculator {
    sha1: Sha1,
    size: u64,
}

impl Sha1Calculator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.size += data.len() as u64;
    }

    /// Bytes seen so far
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Finalize and return the computed metrics
    #[must_use]
    pub fn finalize(self) -> StreamMetrics {
        StreamMetrics {
            size: self.size,
            sha1: hex::encode(self.sha1.finalize()),
        }
    }
}
