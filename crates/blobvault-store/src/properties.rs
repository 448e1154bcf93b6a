//! Property objects
//!
//! Attribute objects, the store metadata object and the metrics snapshot are
//! all flat string maps stored as `key=value` text, compatible with the
//! Java properties format: `#`/`!` comments, `=`, `:` or whitespace as the
//! separator, backslash escapes, `\uXXXX` for non-ASCII and line
//! continuations.

use blobvault_client::ObjectStorageClient;
use blobvault_common::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// A property map bound to an object key
pub struct PropertiesFile {
    client: Arc<dyn ObjectStorageClient>,
    key: String,
    entries: BTreeMap<String, String>,
}

impl PropertiesFile {
    pub fn new(client: Arc<dyn ObjectStorageClient>, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn remove_entry(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn replace_entries(&mut self, entries: BTreeMap<String, String>) {
        self.entries = entries;
    }

    /// Replace the in-memory entries with the stored object
    ///
    /// Returns `false` (leaving the map empty) if the object does not exist.
    pub async fn load(&mut self) -> Result<bool> {
        self.entries.clear();
        let Some(data) = self.client.get(&self.key).await? else {
            return Ok(false);
        };
        let text = std::str::from_utf8(&data).map_err(|e| Error::Properties {
            key: self.key.clone(),
            reason: format!("not valid UTF-8: {e}"),
        })?;
        self.entries = decode(text).map_err(|reason| Error::Properties {
            key: self.key.clone(),
            reason,
        })?;
        debug!("Loaded {} ({} entries)", self.key, self.entries.len());
        Ok(true)
    }

    /// Write the in-memory entries, replacing the stored object
    pub async fn store(&self) -> Result<()> {
        debug!("Storing {} ({} entries)", self.key, self.entries.len());
        self.client
            .put(&self.key, Bytes::from(encode(&self.entries)))
            .await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.client.exists(&self.key).await
    }

    /// Delete the stored object; returns whether it existed
    pub async fn remove(&self) -> Result<bool> {
        self.client.delete(&self.key).await
    }
}

impl std::fmt::Debug for PropertiesFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertiesFile")
            .field("key", &self.key)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

/// Encode a property map as properties text
pub fn encode(entries: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        escape_into(&mut out, key, true);
        out.push('=');
        escape_into(&mut out, value, false);
        out.push('\n');
    }
    out
}

fn escape_into(out: &mut String, text: &str, is_key: bool) {
    for (i, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{000c}' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            c if (' '..='~').contains(&c) => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04X}");
                }
            }
        }
    }
}

/// Decode properties text into a map; later duplicates win
pub fn decode(text: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut entries = BTreeMap::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start_matches([' ', '\t', '\u{000c}']);
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }

        let mut logical = String::from(trimmed);
        while ends_with_continuation(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next.trim_start_matches([' ', '\t', '\u{000c}'])),
                None => break,
            }
        }

        let (raw_key, raw_value) = split_key_value(&logical);
        entries.insert(unescape(raw_key)?, unescape(raw_value)?);
    }
    Ok(entries)
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

fn split_key_value(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\u{000c}' => {
                let key = &line[..i];
                let mut rest = line[i..].trim_start_matches([' ', '\t', '\u{000c}']);
                if c.is_whitespace() {
                    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
                        rest = stripped;
                    }
                } else {
                    rest = &rest[1..];
                }
                return (key, rest.trim_start_matches([' ', '\t', '\u{000c}']));
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(raw: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut pending_high: Option<u16> = None;
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escaped) = chars.next() else {
            break;
        };
        match escaped {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'f' => out.push('\u{000c}'),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                let unit = u16::from_str_radix(&hex, 16)
                    .map_err(|_| format!("malformed \\u escape: \\u{hex}"))?;
                if let Some(high) = pending_high.take() {
                    let decoded = char::decode_utf16([high, unit])
                        .next()
                        .and_then(std::result::Result::ok)
                        .ok_or_else(|| "invalid surrogate pair".to_string())?;
                    out.push(decoded);
                } else if (0xD800..0xDC00).contains(&unit) {
                    pending_high = Some(unit);
                } else {
                    let decoded = char::from_u32(u32::from(unit))
                        .ok_or_else(|| format!("invalid code point \\u{hex}"))?;
                    out.push(decoded);
                }
            }
            other => out.push(other),
        }
    }
    if pending_high.is_some() {
        return Err("unpaired surrogate".to_string());
    }
    Ok(out)
}
