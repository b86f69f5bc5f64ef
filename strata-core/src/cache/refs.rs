//! Cache records and reference handles.
//!
//! Every snapshot is owned by exactly one [`CacheRecord`]; any number of
//! [`ImmutableRef`]/[`MutableRef`] handles may point at it. A record's
//! storage is released only when its last handle drops. Committing a
//! mutable produces a fresh immutable record whose `equal_mutable` is the
//! consumed mutable handle: the mutable's snapshot keeps backing mounts
//! until the immutable is finalized, and releasing the immutable's last
//! handle cascades into the mutable.
//!
//! Lock order: the manager records lock is taken before any record state
//! lock, and nested record-state locks (a record and its sibling) are only
//! ever taken while the manager lock is held. Paths that lock a single
//! record never take the manager lock afterwards. Record metadata is an
//! innermost lock.

use crate::cache::metadata::{CachePolicy, Metadata, SIZE_UNKNOWN};
use crate::cache::{new_id, Cleanup, CmShared};
use crate::content::{lease_labels, LeaseResource};
use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::snapshot::{readonly, IdentityMapping, Mount};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

pub(crate) type RecordMap = HashMap<String, Arc<CacheRecord>>;

/// Observable addressing state of an immutable record.
#[derive(Debug, Clone, Default)]
pub struct RefInfo {
    pub snapshot_id: String,
    pub chain_id: Option<Digest>,
    pub blob_chain_id: Option<Digest>,
    pub diff_id: Option<Digest>,
    pub blob: Option<Digest>,
}

pub(crate) struct CacheRecord {
    pub(crate) id: String,
    pub(crate) mutable: bool,
    pub(crate) cm: Weak<CmShared>,
    pub(crate) md: Mutex<Metadata>,
    pub(crate) st: Mutex<RecState>,
}

#[derive(Default)]
pub(crate) struct RecState {
    /// Handle key -> whether that handle updates last-used on release.
    refs: HashMap<u64, bool>,
    next_key: u64,
    pub(crate) dead: bool,
    parent: Option<ImmutableRef>,
    equal_mutable: Option<MutableRef>,
    equal_immutable: Option<Weak<CacheRecord>>,
    view: Option<String>,
    view_mounts: Option<Vec<Mount>>,
}

impl CacheRecord {
    pub(crate) fn new(
        id: String,
        mutable: bool,
        cm: Weak<CmShared>,
        md: Metadata,
        parent: Option<ImmutableRef>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            mutable,
            cm,
            md: Mutex::new(md),
            st: Mutex::new(RecState { parent, ..RecState::default() }),
        })
    }

    fn shared(&self) -> Result<Arc<CmShared>> {
        self.cm
            .upgrade()
            .ok_or_else(|| StrataError::Internal("cache manager dropped".to_string()))
    }

    pub(crate) fn add_ref(self: &Arc<Self>, trigger_last_used: bool) -> ImmutableRef {
        let mut st = self.st.lock().unwrap();
        let key = st.next_key;
        st.next_key += 1;
        st.refs.insert(key, trigger_last_used);
        ImmutableRef { rec: self.clone(), key, trigger_last_used, released: false }
    }

    pub(crate) fn add_mref(self: &Arc<Self>, trigger_last_used: bool) -> MutableRef {
        let mut st = self.st.lock().unwrap();
        let key = st.next_key;
        st.next_key += 1;
        st.refs.insert(key, trigger_last_used);
        MutableRef { rec: self.clone(), key, trigger_last_used, released: false }
    }

    pub(crate) fn in_use(&self) -> bool {
        !self.st.lock().unwrap().refs.is_empty()
    }

    fn snapshot_id(&self) -> String {
        self.md.lock().unwrap().snapshot_id.clone()
    }

    /// Dead means this record or a sibling sharing its data was removed.
    fn is_dead(&self) -> bool {
        let (dead, em, ei) = {
            let st = self.st.lock().unwrap();
            (
                st.dead,
                st.equal_mutable.as_ref().map(|m| m.rec.clone()),
                st.equal_immutable.as_ref().and_then(|w| w.upgrade()),
            )
        };
        dead || em.map(|r| r.st.lock().unwrap().dead).unwrap_or(false)
            || ei.map(|r| r.st.lock().unwrap().dead).unwrap_or(false)
    }

    /// Disk usage, memoized in metadata. Concurrent queries for the same
    /// record collapse onto one snapshotter call.
    pub(crate) async fn size(self: &Arc<Self>) -> Result<i64> {
        let cm = self.shared()?;
        let rec = self.clone();
        let cm2 = cm.clone();
        cm.size_g
            .run(&self.id, async move {
                let known = rec.md.lock().unwrap().size;
                if known != SIZE_UNKNOWN {
                    return Ok(known);
                }
                let driver_id = {
                    let st = rec.st.lock().unwrap();
                    st.equal_mutable.as_ref().map(|m| m.rec.snapshot_id())
                }
                .unwrap_or_else(|| rec.snapshot_id());
                match cm2.snapshotter.usage(&driver_id).await {
                    Ok(size) => {
                        let mut md = rec.md.lock().unwrap();
                        md.size = size;
                        if let Err(e) = cm2.md_store.save(&md) {
                            warn!(id = %rec.id, error = %e, "failed to persist size");
                        }
                        Ok(size)
                    }
                    Err(_) if rec.is_dead() => Ok(0),
                    Err(e) => Err(StrataError::Internal(format!(
                        "failed to get usage for {}: {}",
                        rec.id, e
                    ))),
                }
            })
            .await
    }

    async fn mount_mutable(&self, readonly_req: bool) -> Result<Vec<Mount>> {
        let cm = self.shared()?;
        let mounts = cm.snapshotter.mounts(&self.snapshot_id()).await?;
        Ok(if readonly_req { readonly(mounts) } else { mounts })
    }

    async fn mount_immutable(self: &Arc<Self>, readonly_req: bool) -> Result<Vec<Mount>> {
        let cm = self.shared()?;

        // While the equal mutable is alive its snapshot backs read-only
        // mounts directly.
        if readonly_req {
            let em_snapshot = {
                let st = self.st.lock().unwrap();
                st.equal_mutable.as_ref().map(|m| m.rec.snapshot_id())
            };
            if let Some(snapshot_id) = em_snapshot {
                let mounts = cm.snapshotter.mounts(&snapshot_id).await?;
                return Ok(readonly(mounts));
            }
        }

        self.finalize_record(true).await?;

        if let Some(mounts) = self.st.lock().unwrap().view_mounts.clone() {
            return Ok(mounts);
        }
        let view_id = new_id();
        let mounts = cm.snapshotter.view(&view_id, &self.snapshot_id()).await?;
        let mut st = self.st.lock().unwrap();
        if let Some(existing) = st.view_mounts.clone() {
            // Lost a racing view creation; discard ours.
            drop(st);
            cm.schedule(Cleanup::RemoveSnapshot { key: view_id });
            return Ok(existing);
        }
        st.view = Some(view_id);
        st.view_mounts = Some(mounts.clone());
        Ok(mounts)
    }

    /// Materialize deferred snapshotter state: commit the equal mutable's
    /// snapshot under this record's name and anchor it with a lease. With
    /// `commit == false` only a retain-policy refresh happens.
    pub(crate) async fn finalize_record(self: &Arc<Self>, commit: bool) -> Result<()> {
        let cm = self.shared()?;

        if !commit {
            let em = {
                let st = self.st.lock().unwrap();
                st.equal_mutable.as_ref().map(|m| m.rec.clone())
            };
            if let Some(m_rec) = em {
                let md = m_rec.md.lock().unwrap();
                if md.cache_policy == CachePolicy::Retain {
                    cm.md_store.save(&md)?;
                }
            }
            return Ok(());
        }

        // Taking the handle out makes concurrent finalizes no-ops.
        let mutable = {
            let mut st = self.st.lock().unwrap();
            st.equal_mutable.take()
        };
        let Some(mut mutable) = mutable else { return Ok(()) };

        let mutable_snapshot = mutable.rec.snapshot_id();
        let own_snapshot = self.snapshot_id();
        if let Err(e) = cm.snapshotter.commit(&own_snapshot, &mutable_snapshot).await {
            self.st.lock().unwrap().equal_mutable = Some(mutable);
            return Err(StrataError::Internal(format!(
                "failed to commit {}: {}",
                mutable_snapshot, e
            )));
        }

        // The mutable record is dead now; its removal (lease teardown
        // included) happens off the hot path.
        mutable.rec.st.lock().unwrap().dead = true;
        mutable.released = true;
        cm.schedule(Cleanup::RemoveRecord { id: mutable.rec.id.clone() });

        cm.lease_manager
            .create(&self.id, lease_labels())
            .await
            .map_err(|e| StrataError::Internal(format!("failed to create lease: {}", e)))?;
        cm.lease_manager
            .add_resource(
                &self.id,
                LeaseResource {
                    id: own_snapshot,
                    kind: format!("snapshots/{}", cm.snapshotter.name()),
                },
            )
            .await?;

        let mut md = self.md.lock().unwrap();
        md.equal_mutable = None;
        cm.md_store.save(&md)?;
        Ok(())
    }

    /// Attach content-addressable descriptors. Idempotent once a chain id
    /// exists; fails if a parent has no chain ids of its own.
    pub(crate) async fn set_blob_record(
        self: &Arc<Self>,
        diff_id: &Digest,
        blob: &Digest,
    ) -> Result<()> {
        let cm = self.shared()?;
        cm.content_store.info(blob).await?;

        if self.md.lock().unwrap().chain_id.is_some() {
            return Ok(());
        }

        self.finalize_record(true).await?;

        let parent = {
            let st = self.st.lock().unwrap();
            st.parent.as_ref().map(|p| p.rec.clone())
        };
        let parent_chains = match parent {
            Some(p) => {
                let md = p.md.lock().unwrap();
                match (&md.chain_id, &md.blob_chain_id) {
                    (Some(c), Some(b)) => Some((c.clone(), b.clone())),
                    _ => return Err(StrataError::NonAddressableParent { id: self.id.clone() }),
                }
            }
            None => None,
        };

        cm.lease_manager
            .add_resource(
                &self.id,
                LeaseResource { id: blob.to_string(), kind: "content".to_string() },
            )
            .await?;

        let mut chain_id = diff_id.clone();
        let mut blob_chain_id = Digest::chain(blob, diff_id);
        if let Some((parent_chain, parent_blob_chain)) = parent_chains {
            chain_id = Digest::chain(&parent_chain, &chain_id);
            blob_chain_id = Digest::chain(&parent_blob_chain, &blob_chain_id);
        }

        let mut md = self.md.lock().unwrap();
        md.diff_id = Some(diff_id.clone());
        md.blob = Some(blob.clone());
        md.chain_id = Some(chain_id);
        md.blob_chain_id = Some(blob_chain_id);
        cm.md_store.save(&md)?;
        Ok(())
    }

    /// Remove the record: drop it from the live map, release its hold on
    /// the parent chain, and (optionally) tear down its lease and
    /// snapshot. Call with the manager lock held.
    pub(crate) fn remove_locked(
        rec: &Arc<CacheRecord>,
        cm: &CmShared,
        records: &mut RecordMap,
        remove_snapshot: bool,
    ) {
        records.remove(&rec.id);
        let parent = {
            let mut st = rec.st.lock().unwrap();
            st.dead = true;
            st.parent.take()
        };
        if let Some(mut parent) = parent {
            parent.release_locked(cm, records);
        }
        if remove_snapshot {
            cm.schedule(Cleanup::DeleteLease { id: rec.id.clone(), snapshot: rec.snapshot_id() });
        }
        if let Err(e) = cm.md_store.clear(&rec.id) {
            warn!(id = %rec.id, error = %e, "failed to clear record metadata");
        }
    }
}

/// Handle to a committed (or committing) snapshot.
pub struct ImmutableRef {
    pub(crate) rec: Arc<CacheRecord>,
    key: u64,
    trigger_last_used: bool,
    released: bool,
}

impl ImmutableRef {
    pub fn id(&self) -> &str {
        &self.rec.id
    }

    pub fn info(&self) -> RefInfo {
        let md = self.rec.md.lock().unwrap();
        RefInfo {
            snapshot_id: md.snapshot_id.clone(),
            chain_id: md.chain_id.clone(),
            blob_chain_id: md.blob_chain_id.clone(),
            diff_id: md.diff_id.clone(),
            blob: md.blob.clone(),
        }
    }

    /// A handle to the parent record, if this record is layered.
    pub fn parent(&self) -> Option<ImmutableRef> {
        let st = self.rec.st.lock().unwrap();
        st.parent.as_ref().map(|p| p.rec.add_ref(true))
    }

    pub fn identity_mapping(&self) -> Option<IdentityMapping> {
        self.rec.cm.upgrade().and_then(|cm| cm.identity_mapping.clone())
    }

    pub async fn mount(&self, readonly: bool) -> Result<Vec<Mount>> {
        self.rec.mount_immutable(readonly).await
    }

    pub async fn size(&self) -> Result<i64> {
        self.rec.size().await
    }

    pub async fn finalize(&self, commit: bool) -> Result<()> {
        self.rec.finalize_record(commit).await
    }

    pub async fn set_blob(&self, diff_id: &Digest, blob: &Digest) -> Result<()> {
        self.rec.set_blob_record(diff_id, blob).await
    }

    /// Release this handle. Equivalent to dropping it; spelled out at call
    /// sites where the release is load-bearing.
    pub fn release(mut self) {
        self.release_now();
    }

    pub(crate) fn release_now(&mut self) {
        if self.released {
            return;
        }
        let Some(cm) = self.rec.cm.upgrade() else {
            self.released = true;
            return;
        };
        let mut records = cm.records.lock().unwrap();
        self.release_locked(&cm, &mut records);
    }

    pub(crate) fn release_locked(&mut self, cm: &CmShared, records: &mut RecordMap) {
        if self.released {
            return;
        }
        self.released = true;
        let rec = self.rec.clone();
        let mut st = rec.st.lock().unwrap();
        st.refs.remove(&self.key);

        if self.trigger_last_used && !st.refs.values().any(|t| *t) {
            let mut md = rec.md.lock().unwrap();
            md.stamp_last_used();
            if let Err(e) = cm.md_store.save(&md) {
                warn!(id = %rec.id, error = %e, "failed to persist last-used");
            }
            drop(md);
            if let Some(em) = st.equal_mutable.as_mut() {
                em.trigger_last_used = true;
            }
        }

        if st.refs.is_empty() {
            if let Some(view) = st.view.take() {
                st.view_mounts = None;
                cm.schedule(Cleanup::RemoveSnapshot { key: view });
            }
            let em = st.equal_mutable.take();
            drop(st);
            if let Some(mut em) = em {
                em.release_locked(cm, records);
            }
        }
    }
}

impl Clone for ImmutableRef {
    /// An additional handle to the same record. Cloned handles do not
    /// update last-used on release.
    fn clone(&self) -> Self {
        self.rec.add_ref(false)
    }
}

impl Drop for ImmutableRef {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Handle to a writable scratch snapshot.
pub struct MutableRef {
    pub(crate) rec: Arc<CacheRecord>,
    key: u64,
    trigger_last_used: bool,
    released: bool,
}

impl MutableRef {
    pub fn id(&self) -> &str {
        &self.rec.id
    }

    pub fn identity_mapping(&self) -> Option<IdentityMapping> {
        self.rec.cm.upgrade().and_then(|cm| cm.identity_mapping.clone())
    }

    pub async fn mount(&self, readonly: bool) -> Result<Vec<Mount>> {
        self.rec.mount_mutable(readonly).await
    }

    pub async fn size(&self) -> Result<i64> {
        self.rec.size().await
    }

    /// Change what happens when the last handle drops.
    pub fn set_cache_policy(&self, policy: CachePolicy) -> Result<()> {
        let cm = self.rec.shared()?;
        let mut md = self.rec.md.lock().unwrap();
        md.cache_policy = policy;
        cm.md_store.save(&md)
    }

    /// Promote to an immutable record. The consumed handle becomes the new
    /// record's equal mutable: its snapshot keeps serving mounts until the
    /// immutable is finalized.
    pub fn commit(mut self) -> Result<ImmutableRef> {
        let cm = self.rec.shared()?;
        let mut records = cm.records.lock().unwrap();
        self.commit_locked(&cm, &mut records)
    }

    fn commit_locked(&mut self, cm: &CmShared, records: &mut RecordMap) -> Result<ImmutableRef> {
        let rec = self.rec.clone();
        {
            let st = rec.st.lock().unwrap();
            if !rec.mutable || st.dead || st.refs.is_empty() || self.released {
                return Err(StrataError::InvalidRef {
                    reason: format!("invalid mutable ref {}", rec.id),
                });
            }
        }

        let id = new_id();
        let parent = {
            let st = rec.st.lock().unwrap();
            st.parent.as_ref().map(|p| p.rec.add_ref(false))
        };

        let mut md = Metadata::new(id.clone());
        md.parent = parent.as_ref().map(|p| p.id().to_string());
        md.committed = true;
        md.equal_mutable = Some(rec.id.clone());
        cm.md_store.save(&md)?;
        cm.md_store.save(&rec.md.lock().unwrap())?;

        let new_rec = CacheRecord::new(id.clone(), false, rec.cm.clone(), md, parent);
        records.insert(id, new_rec.clone());

        // Move this handle into the new record.
        let moved = MutableRef {
            rec: rec.clone(),
            key: self.key,
            trigger_last_used: self.trigger_last_used,
            released: false,
        };
        self.released = true;
        rec.st.lock().unwrap().equal_immutable = Some(Arc::downgrade(&new_rec));

        let handle = new_rec.add_ref(true);
        new_rec.st.lock().unwrap().equal_mutable = Some(moved);
        Ok(handle)
    }

    /// Release this handle. Without retain policy the record is deleted
    /// outright.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if self.released {
            return;
        }
        let Some(cm) = self.rec.cm.upgrade() else {
            self.released = true;
            return;
        };
        let mut records = cm.records.lock().unwrap();
        self.release_locked(&cm, &mut records);
    }

    pub(crate) fn release_locked(&mut self, cm: &CmShared, records: &mut RecordMap) {
        if self.released {
            return;
        }
        self.released = true;
        let rec = self.rec.clone();
        let mut st = rec.st.lock().unwrap();
        st.refs.remove(&self.key);

        let policy = rec.md.lock().unwrap().cache_policy;
        if policy == CachePolicy::Retain {
            if self.trigger_last_used {
                let mut md = rec.md.lock().unwrap();
                md.stamp_last_used();
                if let Err(e) = cm.md_store.save(&md) {
                    warn!(id = %rec.id, error = %e, "failed to persist last-used");
                }
                self.trigger_last_used = false;
            }
            return;
        }

        if let Some(eq_imm) = st.equal_immutable.as_ref().and_then(|w| w.upgrade()) {
            if eq_imm.md.lock().unwrap().cache_policy == CachePolicy::Retain {
                if self.trigger_last_used {
                    let mut md = rec.md.lock().unwrap();
                    md.stamp_last_used();
                    if let Err(e) = cm.md_store.save(&md) {
                        warn!(id = %rec.id, error = %e, "failed to persist last-used");
                    }
                    self.trigger_last_used = false;
                }
                return;
            }
            drop(st);
            CacheRecord::remove_locked(&eq_imm, cm, records, false);
            CacheRecord::remove_locked(&rec, cm, records, true);
            return;
        }
        drop(st);
        CacheRecord::remove_locked(&rec, cm, records, true);
    }
}

impl Drop for MutableRef {
    fn drop(&mut self) {
        self.release_now();
    }
}
