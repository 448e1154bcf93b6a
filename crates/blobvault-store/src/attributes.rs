//! Blob attributes
//!
//! The attribute object of a blob holds its headers, content metrics and
//! deletion marker as a flat property map. Headers are stored under an `@`
//! prefix so they can never collide with the reserved keys.

use crate::properties::PropertiesFile;
use blobvault_client::ObjectStorageClient;
use blobvault_common::{BLOB_NAME_HEADER, BlobMetrics, Error, Headers, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

const HEADER_PREFIX: &str = "@";
const SHA1_HASH_ATTRIBUTE: &str = "sha1";
const CONTENT_SIZE_ATTRIBUTE: &str = "size";
const CREATION_TIME_ATTRIBUTE: &str = "creationTime";
const DELETED_ATTRIBUTE: &str = "deleted";
const DELETED_REASON_ATTRIBUTE: &str = "deletedReason";
const DELETED_DATETIME_ATTRIBUTE: &str = "deletedDateTime";

/// Persisted state of one blob apart from its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttributes {
    pub headers: Headers,
    pub metrics: BlobMetrics,
    pub deleted: bool,
    pub deleted_reason: Option<String>,
    pub deleted_date_time: Option<DateTime<Utc>>,
}

impl BlobAttributes {
    pub const fn new(headers: Headers, metrics: BlobMetrics) -> Self {
        Self {
            headers,
            metrics,
            deleted: false,
            deleted_reason: None,
            deleted_date_time: None,
        }
    }

    /// Caller-visible name of the blob, if recorded
    pub fn blob_name(&self) -> Option<&str> {
        self.headers.get(BLOB_NAME_HEADER).map(String::as_str)
    }

    /// Set the deletion marker
    pub fn mark_deleted(&mut self, reason: impl Into<String>) {
        self.deleted = true;
        self.deleted_reason = Some(reason.into());
        self.deleted_date_time = Some(Utc::now());
    }

    /// Clear the deletion marker
    pub fn clear_deleted(&mut self) {
        self.deleted = false;
        self.deleted_reason = None;
        self.deleted_date_time = None;
    }

    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props: BTreeMap<String, String> = self
            .headers
            .iter()
            .map(|(k, v)| (format!("{HEADER_PREFIX}{k}"), v.clone()))
            .collect();
        props.insert(SHA1_HASH_ATTRIBUTE.to_string(), self.metrics.sha1_hash.clone());
        props.insert(
            CONTENT_SIZE_ATTRIBUTE.to_string(),
            self.metrics.content_size.to_string(),
        );
        props.insert(
            CREATION_TIME_ATTRIBUTE.to_string(),
            self.metrics.creation_time.timestamp_millis().to_string(),
        );
        if self.deleted {
            props.insert(DELETED_ATTRIBUTE.to_string(), "true".to_string());
            if let Some(reason) = &self.deleted_reason {
                props.insert(DELETED_REASON_ATTRIBUTE.to_string(), reason.clone());
            }
            if let Some(when) = self.deleted_date_time {
                props.insert(
                    DELETED_DATETIME_ATTRIBUTE.to_string(),
                    when.timestamp_millis().to_string(),
                );
            }
        }
        props
    }

    /// Parse attributes read from the object at `key`
    pub fn from_properties(key: &str, props: &BTreeMap<String, String>) -> Result<Self> {
        let invalid = |reason: String| Error::Properties {
            key: key.to_string(),
            reason,
        };
        let required = |name: &str| {
            props
                .get(name)
                .ok_or_else(|| invalid(format!("missing {name}")))
        };

        let headers = props
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(HEADER_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect();

        let content_size = required(CONTENT_SIZE_ATTRIBUTE)?
            .parse::<u64>()
            .map_err(|e| invalid(format!("bad {CONTENT_SIZE_ATTRIBUTE}: {e}")))?;
        let creation_time = parse_millis(required(CREATION_TIME_ATTRIBUTE)?)
            .ok_or_else(|| invalid(format!("bad {CREATION_TIME_ATTRIBUTE}")))?;
        let sha1_hash = required(SHA1_HASH_ATTRIBUTE)?.clone();

        let deleted = props
            .get(DELETED_ATTRIBUTE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let deleted_date_time = match props.get(DELETED_DATETIME_ATTRIBUTE) {
            Some(v) => Some(
                parse_millis(v)
                    .ok_or_else(|| invalid(format!("bad {DELETED_DATETIME_ATTRIBUTE}")))?,
            ),
            None => None,
        };

        Ok(Self {
            headers,
            metrics: BlobMetrics::new(creation_time, sha1_hash, content_size),
            deleted,
            deleted_reason: props.get(DELETED_REASON_ATTRIBUTE).cloned(),
            deleted_date_time,
        })
    }

    /// Read attributes from `key`; `None` if the object does not exist
    pub async fn load(client: Arc<dyn ObjectStorageClient>, key: &str) -> Result<Option<Self>> {
        let mut file = PropertiesFile::new(client, key);
        if !file.load().await? {
            return Ok(None);
        }
        Self::from_properties(key, file.entries()).map(Some)
    }

    /// Write attributes to `key`, replacing whatever was there
    pub async fn store(&self, client: Arc<dyn ObjectStorageClient>, key: &str) -> Result<()> {
        let mut file = PropertiesFile::new(client, key);
        file.replace_entries(self.to_properties());
        file.store().await
    }
}

fn parse_millis(value: &str) -> Option<DateTime<Utc>> {
    let millis = value.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobvault_client::MemoryObjectStorage;
    use blobvault_common::CONTENT_TYPE_HEADER;

    fn sample() -> BlobAttributes {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), "a.txt".to_string());
        headers.insert(CONTENT_TYPE_HEADER.to_string(), "text/plain".to_string());
        let created = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        BlobAttributes::new(
            headers,
            BlobMetrics::new(created, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d", 5),
        )
    }

    #[test]
    fn test_property_layout() {
        let props = sample().to_properties();
        assert_eq!(props.get("@BlobStore.blob-name").unwrap(), "a.txt");
        assert_eq!(props.get("size").unwrap(), "5");
        assert_eq!(props.get("creationTime").unwrap(), "1700000000123");
        assert!(!props.contains_key("deleted"));
    }

    #[test]
    fn test_deletion_marker() {
        let mut attrs = sample();
        attrs.mark_deleted("no longer referenced");
        let parsed = BlobAttributes::from_properties("k", &attrs.to_properties()).unwrap();
        assert!(parsed.deleted);
        assert_eq!(parsed.deleted_reason.as_deref(), Some("no longer referenced"));
        assert!(parsed.deleted_date_time.is_some());

        attrs.clear_deleted();
        let parsed = BlobAttributes::from_properties("k", &attrs.to_properties()).unwrap();
        assert!(!parsed.deleted);
        assert_eq!(parsed, sample());
    }

    #[test]
    fn test_missing_metrics_rejected() {
        let mut props = sample().to_properties();
        props.remove("size");
        let err = BlobAttributes::from_properties("content/x.properties", &props).unwrap_err();
        assert!(matches!(err, Error::Properties { .. }));
    }

    #[tokio::test]
    async fn test_load_store() {
        let client = Arc::new(MemoryObjectStorage::new("test"));
        client.create_container().await.unwrap();
        let client: Arc<dyn ObjectStorageClient> = client;

        assert!(BlobAttributes::load(client.clone(), "x.properties").await.unwrap().is_none());
        sample().store(client.clone(), "x.properties").await.unwrap();
        let loaded = BlobAttributes::load(client, "x.properties").await.unwrap().unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(loaded.blob_name(), Some("a.txt"));
    }
}
