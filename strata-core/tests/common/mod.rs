//! Shared test rig: a cache manager over real temp-dir storage plus
//! scripted source and worker doubles.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_core::cache::{CacheManager, CacheManagerOpt, ImmutableRef};
use strata_core::content::{MemoryContentStore, MemoryLeaseManager};
use strata_core::snapshot::local::DirSnapshotter;
use strata_core::snapshot::Mount;
use strata_core::source::{Identifier, Source};
use strata_core::worker::{Meta, Worker};
use tempfile::TempDir;

pub struct Rig {
    pub tmp: TempDir,
    pub cache: CacheManager,
    pub leases: Arc<MemoryLeaseManager>,
    pub content: Arc<MemoryContentStore>,
}

pub fn rig() -> Rig {
    let tmp = TempDir::new().unwrap();
    let leases = Arc::new(MemoryLeaseManager::new());
    let content = Arc::new(MemoryContentStore::new());
    let cache = CacheManager::new(CacheManagerOpt {
        root: tmp.path().to_path_buf(),
        snapshotter: Arc::new(DirSnapshotter::new(tmp.path().join("snapshots")).unwrap()),
        content_store: content.clone(),
        lease_manager: leases.clone(),
        identity_mapping: None,
    })
    .unwrap();
    Rig { tmp, cache, leases, content }
}

/// Source double: materializes a marker file and counts backend pulls.
pub struct CountingSource {
    cache: CacheManager,
    pulls: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    pub fn new(cache: CacheManager) -> Self {
        Self { cache, pulls: AtomicUsize::new(0), delay: Duration::ZERO }
    }

    pub fn with_delay(cache: CacheManager, delay: Duration) -> Self {
        Self { cache, pulls: AtomicUsize::new(0), delay }
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for CountingSource {
    fn scheme(&self) -> &'static str {
        "docker-image"
    }

    async fn pull(&self, id: &Identifier) -> strata_core::Result<ImmutableRef> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let active = self.cache.new_mutable(None).await?;
        let mounts = active.mount(false).await?;
        std::fs::write(mounts[0].source.join("base.txt"), id.to_string()).unwrap();
        active.commit()
    }
}

#[derive(Clone, Debug)]
pub struct ExecRecord {
    pub args: Vec<String>,
    pub dests: Vec<String>,
}

/// Worker double: records dispatches, optionally failing or stalling on
/// configured argv markers.
#[derive(Default)]
pub struct RecordingWorker {
    execs: Mutex<Vec<ExecRecord>>,
    fail_on: Option<String>,
    stall_on: Option<String>,
}

impl RecordingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with "boom" when argv contains `marker`.
    pub fn failing_on(marker: &str) -> Self {
        Self { fail_on: Some(marker.to_string()), ..Self::default() }
    }

    /// Additionally sleep when argv contains `marker`, so the sibling
    /// failure lands first.
    pub fn stalling_on(mut self, marker: &str) -> Self {
        self.stall_on = Some(marker.to_string());
        self
    }

    pub fn execs(&self) -> Vec<ExecRecord> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn exec(
        &self,
        meta: &Meta,
        mounts: &HashMap<String, Vec<Mount>>,
        stdout: &mut (dyn Write + Send),
        _stderr: &mut (dyn Write + Send),
    ) -> anyhow::Result<()> {
        let mut dests: Vec<String> = mounts.keys().cloned().collect();
        dests.sort();
        self.execs.lock().unwrap().push(ExecRecord { args: meta.args.clone(), dests });

        if let Some(marker) = &self.stall_on {
            if meta.args.iter().any(|a| a.contains(marker.as_str())) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        if let Some(marker) = &self.fail_on {
            if meta.args.iter().any(|a| a.contains(marker.as_str())) {
                anyhow::bail!("boom");
            }
        }

        // Leave a trace in the writable root so outputs are real.
        if let Some(root) = mounts.get("/").and_then(|m| m.first()) {
            std::fs::write(root.source.join(format!("ran-{}.txt", meta.args.join("-"))), b"ok")
                .ok();
        }
        writeln!(stdout, "ran {}", meta.args.join(" ")).ok();
        Ok(())
    }
}

/// Walk an error chain into one string for containment asserts.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}
