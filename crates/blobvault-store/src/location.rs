//! Blob id resolution and object key layout
//!
//! Every blob is stored as two objects sharing a location:
//! `content/<location>.bytes` holds the content and
//! `content/<location>.properties` holds its attributes.

use blobvault_common::{
    BlobId, DIRECT_PATH_BLOB_HEADER, DIRECT_PATH_ID_PREFIX, Headers, TEMPORARY_BLOB_HEADER,
    BLOB_NAME_HEADER,
};

/// Prefix of every blob object key
pub const CONTENT_PREFIX: &str = "content/";

/// Suffix of content objects
pub const BYTES_SUFFIX: &str = ".bytes";

/// Suffix of attribute objects
pub const PROPERTIES_SUFFIX: &str = ".properties";

/// Location directory holding direct-path blobs
pub const DIRECT_PATH_ROOT: &str = "directpath";

/// Location directory holding temporary blobs
pub const TEMPORARY_BLOB_ROOT: &str = "tmp";

const VOLUME_COUNT: u32 = 43;
const CHAPTER_COUNT: u32 = 47;

/// Maps blobs to ids and ids to storage locations
pub trait BlobIdLocationResolver: Send + Sync {
    /// Path-like location of a blob, without the content prefix or suffix
    fn location(&self, id: &BlobId) -> String;

    /// Id for a new blob with the given headers
    fn from_headers(&self, headers: &Headers) -> BlobId;
}

/// Volume/chapter fan-out for generated ids, name-based paths for direct-path
/// blobs, and a flat directory for temporary blobs
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLocationResolver;

impl DefaultLocationResolver {
    pub const fn new() -> Self {
        Self
    }
}

impl BlobIdLocationResolver for DefaultLocationResolver {
    fn location(&self, id: &BlobId) -> String {
        if let Some(name) = id.direct_path_name() {
            return format!("{DIRECT_PATH_ROOT}/{name}");
        }
        if id.is_temporary() {
            return format!("{TEMPORARY_BLOB_ROOT}/{id}");
        }
        let hash = crc32c::crc32c(id.as_str().as_bytes());
        format!(
            "vol-{:02}/chap-{:02}/{id}",
            hash % VOLUME_COUNT + 1,
            hash % CHAPTER_COUNT + 1
        )
    }

    fn from_headers(&self, headers: &Headers) -> BlobId {
        if is_flag_set(headers, DIRECT_PATH_BLOB_HEADER) {
            if let Some(name) = headers.get(BLOB_NAME_HEADER) {
                return BlobId::direct_path(name);
            }
        }
        if is_flag_set(headers, TEMPORARY_BLOB_HEADER) {
            return BlobId::temporary();
        }
        BlobId::random()
    }
}

fn is_flag_set(headers: &Headers, name: &str) -> bool {
    headers
        .get(name)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Key of the content object at `location`
pub fn content_key(location: &str) -> String {
    format!("{CONTENT_PREFIX}{location}{BYTES_SUFFIX}")
}

/// Key of the attribute object at `location`
pub fn attribute_key(location: &str) -> String {
    format!("{CONTENT_PREFIX}{location}{PROPERTIES_SUFFIX}")
}

/// Listing prefix for direct-path attribute objects under `prefix`
pub fn direct_path_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_start_matches('/');
    format!("{CONTENT_PREFIX}{DIRECT_PATH_ROOT}/{prefix}")
}

/// Recover the blob id from an attribute object key
///
/// Returns `None` for keys that are not attribute objects.
pub fn blob_id_from_attribute_key(key: &str) -> Option<BlobId> {
    let location = key
        .strip_prefix(CONTENT_PREFIX)?
        .strip_suffix(PROPERTIES_SUFFIX)?;
    if let Some(name) = location
        .strip_prefix(DIRECT_PATH_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        return Some(BlobId::new(format!("{DIRECT_PATH_ID_PREFIX}{name}")));
    }
    let stem = location.rsplit('/').next()?;
    (!stem.is_empty()).then(|| BlobId::new(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_location_fan_out() {
        let resolver = DefaultLocationResolver::new();
        let id = BlobId::new("0a1b2c3d-0000-4000-8000-000000000001");
        let location = resolver.location(&id);

        let hash = crc32c::crc32c(id.as_str().as_bytes());
        let expected = format!(
            "vol-{:02}/chap-{:02}/{}",
            hash % 43 + 1,
            hash % 47 + 1,
            id
        );
        assert_eq!(location, expected);
        // Deterministic
        assert_eq!(resolver.location(&id), location);
    }

    #[test]
    fn test_direct_path_and_temporary_locations() {
        let resolver = DefaultLocationResolver::new();
        assert_eq!(
            resolver.location(&BlobId::direct_path("health/report.json")),
            "directpath/health/report.json"
        );
        let tmp = BlobId::temporary();
        assert_eq!(resolver.location(&tmp), format!("tmp/{tmp}"));
    }

    #[test]
    fn test_from_headers() {
        let resolver = DefaultLocationResolver::new();
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), "a/b.txt".to_string());
        assert!(!resolver.from_headers(&headers).is_direct_path());

        headers.insert(DIRECT_PATH_BLOB_HEADER.to_string(), "true".to_string());
        assert_eq!(resolver.from_headers(&headers), BlobId::direct_path("a/b.txt"));

        let mut temp = Headers::new();
        temp.insert(TEMPORARY_BLOB_HEADER.to_string(), "TRUE".to_string());
        assert!(resolver.from_headers(&temp).is_temporary());
    }

    #[test]
    fn test_keys_round_trip_to_ids() {
        let resolver = DefaultLocationResolver::new();
        for id in [
            BlobId::random(),
            BlobId::temporary(),
            BlobId::direct_path("dir/sub/file.bin"),
        ] {
            let key = attribute_key(&resolver.location(&id));
            assert_eq!(blob_id_from_attribute_key(&key), Some(id));
        }
    }

    #[test]
    fn test_non_attribute_keys_ignored() {
        assert_eq!(blob_id_from_attribute_key("content/vol-01/chap-02/x.bytes"), None);
        assert_eq!(blob_id_from_attribute_key("metadata.properties"), None);
        assert_eq!(blob_id_from_attribute_key("content/.properties"), None);
    }

    #[test]
    fn test_direct_path_prefix() {
        assert_eq!(direct_path_prefix("/health"), "content/directpath/health");
        assert_eq!(direct_path_prefix(""), "content/directpath/");
    }
}
