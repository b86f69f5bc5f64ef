//! Reference-counted snapshot cache.
//!
//! The [`CacheManager`] owns the live record map and hands out
//! [`ImmutableRef`]/[`MutableRef`] handles. Handle bookkeeping is
//! synchronous; storage teardown (views, leases, snapshots) is pushed onto
//! a background cleanup task whose failures are logged and swallowed so
//! they never mask a primary error.

pub mod metadata;
mod refs;

pub use metadata::CachePolicy;
pub use refs::{ImmutableRef, MutableRef, RefInfo};

use crate::content::{lease_labels, ContentStore, LeaseManager, LeaseResource};
use crate::error::{Result, StrataError};
use crate::singleflight::Group;
use crate::snapshot::{IdentityMapping, Snapshotter};
use metadata::{Metadata, MetadataStore};
use refs::{CacheRecord, RecordMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Deferred storage teardown performed by the cleanup task.
pub(crate) enum Cleanup {
    /// Remove a snapshotter key (cached views, stale snapshots).
    RemoveSnapshot { key: String },
    /// Delete a record's lease and its backing snapshot.
    DeleteLease { id: String, snapshot: String },
    /// Remove a record that was marked dead outside the manager lock.
    RemoveRecord { id: String },
}

pub struct CacheManagerOpt {
    pub root: PathBuf,
    pub snapshotter: Arc<dyn Snapshotter>,
    pub content_store: Arc<dyn ContentStore>,
    pub lease_manager: Arc<dyn LeaseManager>,
    pub identity_mapping: Option<IdentityMapping>,
}

pub(crate) struct CmShared {
    pub(crate) records: Mutex<RecordMap>,
    pub(crate) md_store: MetadataStore,
    pub(crate) snapshotter: Arc<dyn Snapshotter>,
    pub(crate) content_store: Arc<dyn ContentStore>,
    pub(crate) lease_manager: Arc<dyn LeaseManager>,
    pub(crate) identity_mapping: Option<IdentityMapping>,
    pub(crate) size_g: Group<i64>,
    cleanup_tx: mpsc::UnboundedSender<Cleanup>,
    pending: AtomicUsize,
    flush_notify: Notify,
}

impl CmShared {
    pub(crate) fn schedule(&self, task: Cleanup) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.cleanup_tx.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn settle_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.flush_notify.notify_waiters();
    }
}

/// One row of `disk_usage` output.
#[derive(Debug, Clone)]
pub struct UsageInfo {
    pub id: String,
    pub mutable: bool,
    pub in_use: bool,
    pub size: i64,
}

#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CmShared>,
}

impl CacheManager {
    pub fn new(opt: CacheManagerOpt) -> Result<Self> {
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CmShared {
            records: Mutex::new(RecordMap::new()),
            md_store: MetadataStore::new(&opt.root)?,
            snapshotter: opt.snapshotter,
            content_store: opt.content_store,
            lease_manager: opt.lease_manager,
            identity_mapping: opt.identity_mapping,
            size_g: Group::new(),
            cleanup_tx,
            pending: AtomicUsize::new(0),
            flush_notify: Notify::new(),
        });
        tokio::spawn(run_cleanup(Arc::downgrade(&inner), cleanup_rx));
        Ok(Self { inner })
    }

    /// Create a writable scratch record, optionally layered atop a parent.
    /// The snapshot is anchored by a lease keyed by the record id.
    pub async fn new_mutable(&self, parent: Option<&ImmutableRef>) -> Result<MutableRef> {
        let parent = match parent {
            Some(p) => {
                // The snapshotter can only layer on materialized state.
                p.finalize(true).await?;
                Some(p.clone())
            }
            None => None,
        };

        let id = new_id();
        let parent_snapshot = parent.as_ref().map(|p| p.info().snapshot_id);

        self.inner
            .lease_manager
            .create(&id, lease_labels())
            .await
            .map_err(|e| StrataError::Internal(format!("failed to create lease: {}", e)))?;
        self.inner
            .lease_manager
            .add_resource(
                &id,
                LeaseResource {
                    id: id.clone(),
                    kind: format!("snapshots/{}", self.inner.snapshotter.name()),
                },
            )
            .await?;
        if let Err(e) = self.inner.snapshotter.prepare(&id, parent_snapshot.as_deref()).await {
            if let Err(del) = self.inner.lease_manager.delete(&id).await {
                warn!(id, error = %del, "failed to roll back lease");
            }
            return Err(e);
        }

        let mut md = Metadata::new(id.clone());
        md.parent = parent.as_ref().map(|p| p.id().to_string());
        self.inner.md_store.save(&md)?;

        let rec = CacheRecord::new(id.clone(), true, Arc::downgrade(&self.inner), md, parent);
        let handle = rec.add_mref(true);
        self.inner.records.lock().unwrap().insert(id.clone(), rec);
        debug!(id, parent = ?parent_snapshot, "created mutable record");
        Ok(handle)
    }

    /// Look up a committed record.
    pub fn get(&self, id: &str) -> Result<ImmutableRef> {
        let records = self.inner.records.lock().unwrap();
        let rec = records.get(id).ok_or_else(|| StrataError::NotFound { id: id.to_string() })?;
        if rec.mutable {
            return Err(StrataError::InvalidRef { reason: format!("{} is not committed", id) });
        }
        Ok(rec.add_ref(true))
    }

    /// Enumerate all live records with their memoized or freshly queried
    /// sizes.
    pub async fn disk_usage(&self) -> Result<Vec<UsageInfo>> {
        let records: Vec<Arc<CacheRecord>> =
            self.inner.records.lock().unwrap().values().cloned().collect();
        let mut out = Vec::with_capacity(records.len());
        for rec in records {
            let size = rec.size().await?;
            out.push(UsageInfo {
                id: rec.id.clone(),
                mutable: rec.mutable,
                in_use: rec.in_use(),
                size,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub fn identity_mapping(&self) -> Option<IdentityMapping> {
        self.inner.identity_mapping.clone()
    }

    /// Wait until all scheduled storage teardown has run. Used by tests
    /// and by daemon shutdown.
    pub async fn flush(&self) {
        loop {
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.inner.flush_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_cleanup(
    inner: std::sync::Weak<CmShared>,
    mut rx: mpsc::UnboundedReceiver<Cleanup>,
) {
    while let Some(task) = rx.recv().await {
        let Some(cm) = inner.upgrade() else { break };
        match task {
            Cleanup::RemoveSnapshot { key } => {
                if let Err(e) = cm.snapshotter.remove(&key).await {
                    warn!(key, error = %e, "failed to remove snapshot");
                }
            }
            Cleanup::DeleteLease { id, snapshot } => {
                if let Err(e) = cm.lease_manager.delete(&id).await {
                    warn!(id, error = %e, "failed to delete lease");
                }
                if let Err(e) = cm.snapshotter.remove(&snapshot).await {
                    warn!(snapshot, error = %e, "failed to remove snapshot");
                }
            }
            Cleanup::RemoveRecord { id } => {
                let mut records = cm.records.lock().unwrap();
                if let Some(rec) = records.get(&id).cloned() {
                    CacheRecord::remove_locked(&rec, &cm, &mut records, true);
                }
            }
        }
        cm.settle_one();
    }
}
