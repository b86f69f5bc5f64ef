//! Content store and lease manager seams.
//!
//! The ref store anchors snapshots and blobs through leases so the storage
//! backend never collects data that a live record still depends on. Both
//! backends are collaborators; the in-memory implementations here back the
//! daemon's default wiring and the tests.

use crate::digest::Digest;
use crate::error::{Result, StrataError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Label attached to every lease, carrying its creation time.
pub const GC_FLAT_LABEL: &str = "strata.io/gc.flat";

#[derive(Debug, Clone)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: i64,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Look up a blob. Errors with `NotFound` if the blob is absent.
    async fn info(&self, digest: &Digest) -> Result<ContentInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseResource {
    pub id: String,
    /// Resource kind, e.g. "content" or "snapshots/dir".
    pub kind: String,
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    async fn create(&self, id: &str, labels: HashMap<String, String>) -> Result<()>;
    async fn add_resource(&self, lease_id: &str, resource: LeaseResource) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// The standard label set for a fresh lease: an RFC3339-nano timestamp
/// under [`GC_FLAT_LABEL`].
pub fn lease_labels() -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(
        GC_FLAT_LABEL.to_string(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
    );
    labels
}

#[derive(Debug)]
struct Lease {
    labels: HashMap<String, String>,
    resources: Vec<LeaseResource>,
}

/// In-memory lease manager.
#[derive(Default)]
pub struct MemoryLeaseManager {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of all live leases. Test and debugging aid.
    pub fn lease_ids(&self) -> Vec<String> {
        self.leases.lock().unwrap().keys().cloned().collect()
    }

    /// Resources held by a lease, if it exists.
    pub fn resources(&self, id: &str) -> Option<Vec<LeaseResource>> {
        self.leases.lock().unwrap().get(id).map(|l| l.resources.clone())
    }
}

#[async_trait]
impl LeaseManager for MemoryLeaseManager {
    async fn create(&self, id: &str, labels: HashMap<String, String>) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(id) {
            return Err(StrataError::InvalidRef { reason: format!("lease {} already exists", id) });
        }
        leases.insert(id.to_string(), Lease { labels, resources: Vec::new() });
        Ok(())
    }

    async fn add_resource(&self, lease_id: &str, resource: LeaseResource) -> Result<()> {
        let mut leases = self.leases.lock().unwrap();
        let lease = leases
            .get_mut(lease_id)
            .ok_or_else(|| StrataError::NotFound { id: lease_id.to_string() })?;
        if !lease.resources.contains(&resource) {
            lease.resources.push(resource);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.leases
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StrataError::NotFound { id: id.to_string() })
    }
}

/// In-memory content store.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Digest, i64>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, digest: Digest, size: i64) {
        self.blobs.lock().unwrap().insert(digest, size);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .map(|size| ContentInfo { digest: digest.clone(), size: *size })
            .ok_or_else(|| StrataError::NotFound { id: digest.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let lm = MemoryLeaseManager::new();
        lm.create("lease-1", lease_labels()).await.unwrap();
        assert!(lm.create("lease-1", lease_labels()).await.is_err());

        lm.add_resource(
            "lease-1",
            LeaseResource { id: "snap-1".to_string(), kind: "snapshots/dir".to_string() },
        )
        .await
        .unwrap();
        assert_eq!(lm.resources("lease-1").unwrap().len(), 1);

        lm.delete("lease-1").await.unwrap();
        assert!(lm.delete("lease-1").await.is_err());
    }

    #[tokio::test]
    async fn test_content_store() {
        let cs = MemoryContentStore::new();
        let d = Digest::from_bytes(b"blob");
        assert!(cs.info(&d).await.is_err());
        cs.put(d.clone(), 4);
        assert_eq!(cs.info(&d).await.unwrap().size, 4);
    }

    #[test]
    fn test_lease_labels() {
        let labels = lease_labels();
        assert!(labels.contains_key(GC_FLAT_LABEL));
    }
}
