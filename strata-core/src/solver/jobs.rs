//! In-flight job registry.
//!
//! Maps build id to a running solve. Registration wakes waiting `get`
//! callers so status subscribers may race slightly ahead of solve
//! initiation; a job is deregistered when its guard drops, which happens
//! when the owning solve completes or is cancelled.

use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::progress::{MultiReader, ProgressEvent};
use crate::solver::{SolveStatus, Vertex, VertexStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

pub(crate) struct JobList {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    notify: Notify,
    wait_timeout: Duration,
}

pub(crate) struct Job {
    root: Arc<Vertex>,
    reader: MultiReader,
}

/// Removes the registry entry on drop.
pub(crate) struct JobGuard {
    id: String,
    list: Weak<JobList>,
}

impl JobList {
    pub(crate) fn new(wait_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { jobs: Mutex::new(HashMap::new()), notify: Notify::new(), wait_timeout })
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        id: &str,
        root: Arc<Vertex>,
        reader: MultiReader,
    ) -> Result<JobGuard> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(id) {
            return Err(StrataError::DuplicateJob { id: id.to_string() });
        }
        jobs.insert(id.to_string(), Arc::new(Job { root, reader }));
        drop(jobs);
        self.notify.notify_waiters();
        debug!(id, "registered job");
        Ok(JobGuard { id: id.to_string(), list: Arc::downgrade(self) })
    }

    /// Look up a job, waiting up to the registry timeout for it to appear.
    pub(crate) async fn get(&self, id: &str) -> Result<Arc<Job>> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.jobs.lock().unwrap().get(id).cloned() {
                return Ok(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(StrataError::NoSuchJob { id: id.to_string() });
            }
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.jobs.lock().unwrap().remove(&self.id);
            debug!(id = %self.id, "deregistered job");
        }
    }
}

impl Job {
    /// Stream this job to a subscriber: first the full topology, one
    /// message per unique vertex digest, then live progress until the bus
    /// closes or the subscriber goes away.
    pub(crate) async fn pipe(&self, sender: &mpsc::Sender<SolveStatus>) -> Result<()> {
        let mut rx = self.reader.reader();

        let mut seen = HashSet::new();
        let mut topology = Vec::new();
        collect(&self.root, &mut seen, &mut topology);
        for status in topology {
            sender
                .send(SolveStatus { vertexes: vec![status], logs: Vec::new() })
                .await
                .map_err(|_| StrataError::Canceled)?;
        }

        while let Some(progress) = rx.recv().await {
            let status = match &progress.event {
                ProgressEvent::Vertex(v) => {
                    SolveStatus { vertexes: vec![v.clone()], logs: Vec::new() }
                }
                ProgressEvent::Log(l) => {
                    SolveStatus { vertexes: Vec::new(), logs: vec![l.clone()] }
                }
            };
            sender.send(status).await.map_err(|_| StrataError::Canceled)?;
        }
        Ok(())
    }
}

/// Post-order walk emitting each unique vertex once.
fn collect(vertex: &Arc<Vertex>, seen: &mut HashSet<Digest>, out: &mut Vec<VertexStatus>) {
    for input in vertex.inputs() {
        collect(input, seen, out);
    }
    if seen.insert(vertex.digest().clone()) {
        out.push(vertex.status_snapshot());
    }
}
