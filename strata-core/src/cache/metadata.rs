//! Persisted per-record metadata.
//!
//! Each cache record has one JSON document keyed by record id under
//! `<root>/metadata/`. The document carries everything that must survive a
//! daemon restart: the parent link, snapshot id, memoized size, chain ids,
//! cache policy, and usage stamps.

use crate::digest::Digest;
use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for an unknown (not yet queried) size.
pub const SIZE_UNKNOWN: i64 = -1;

/// What happens to a record when its last reference drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Mutable records are deleted on last release.
    #[default]
    Default,
    /// The record survives release and only refreshes its last-used stamp.
    Retain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    /// Snapshotter-level key backing this record.
    pub snapshot_id: String,
    /// Parent record id, if layered.
    pub parent: Option<String>,
    /// The mutable record this one was committed from, while it is alive.
    pub equal_mutable: Option<String>,
    pub committed: bool,
    pub cache_policy: CachePolicy,
    /// Memoized disk usage; [`SIZE_UNKNOWN`] until first queried.
    pub size: i64,
    /// Unix milliseconds of the last release of a tracking ref.
    pub last_used_ms: Option<i64>,
    pub diff_id: Option<Digest>,
    pub blob: Option<Digest>,
    pub chain_id: Option<Digest>,
    pub blob_chain_id: Option<Digest>,
}

impl Metadata {
    pub fn new(id: String) -> Self {
        Self {
            snapshot_id: id.clone(),
            id,
            parent: None,
            equal_mutable: None,
            committed: false,
            cache_policy: CachePolicy::Default,
            size: SIZE_UNKNOWN,
            last_used_ms: None,
            diff_id: None,
            blob: None,
            chain_id: None,
            blob_chain_id: None,
        }
    }

    pub fn stamp_last_used(&mut self) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.last_used_ms = Some(now.as_millis() as i64);
    }
}

/// Keyed metadata store: one JSON file per record id.
#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(root: &Path) -> Result<Self> {
        let dir = root.join("metadata");
        fs::create_dir_all(&dir).map_err(|e| StrataError::Io { path: dir.clone(), source: e })?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn load(&self, id: &str) -> Result<Option<Metadata>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).map_err(|e| StrataError::Io { path, source: e })?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, md: &Metadata) -> Result<()> {
        let path = self.path(&md.id);
        let json = serde_json::to_string_pretty(md)?;
        fs::write(&path, json).map_err(|e| StrataError::Io { path, source: e })
    }

    pub fn clear(&self, id: &str) -> Result<()> {
        let path = self.path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StrataError::Io { path, source: e })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(tmp.path()).unwrap();

        assert!(store.load("missing").unwrap().is_none());

        let mut md = Metadata::new("rec-1".to_string());
        md.committed = true;
        md.parent = Some("rec-0".to_string());
        md.chain_id = Some(Digest::from_bytes(b"diff"));
        store.save(&md).unwrap();

        let loaded = store.load("rec-1").unwrap().unwrap();
        assert_eq!(loaded.id, "rec-1");
        assert!(loaded.committed);
        assert_eq!(loaded.parent.as_deref(), Some("rec-0"));
        assert_eq!(loaded.chain_id, md.chain_id);
        assert_eq!(loaded.size, SIZE_UNKNOWN);

        store.clear("rec-1").unwrap();
        assert!(store.load("rec-1").unwrap().is_none());
        // Clearing twice is fine.
        store.clear("rec-1").unwrap();
    }

    #[test]
    fn test_stamp_last_used() {
        let mut md = Metadata::new("rec".to_string());
        assert!(md.last_used_ms.is_none());
        md.stamp_last_used();
        assert!(md.last_used_ms.unwrap() > 0);
    }
}
