//! Vertex evaluator.
//!
//! Walks the build DAG bottom-up with at-most-once execution per vertex: a
//! per-vertex async mutex is held for the whole evaluation, success is
//! idempotent, and failure is sticky. Parents evaluate in parallel;
//! dropping the join on the first error cancels the remaining siblings.
//! Source vertices pull through the source manager, exec vertices resolve
//! mounts from their parents' outputs, run the worker, and commit their
//! scratch snapshots in output order.

mod jobs;
mod load;

pub use load::load;

use crate::cache::{CacheManager, ImmutableRef, MutableRef};
use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::llb::{EMPTY_INPUT, SKIP_OUTPUT};
use crate::progress::{self, MultiReader, ProgressEvent, ProgressWriter};
use crate::snapshot::Mount;
use crate::source::{Identifier, SourceManager};
use crate::worker::{Meta, Worker};
use futures::future::{try_join_all, BoxFuture};
use jobs::JobList;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strata_api::strata::v1 as pb;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// How long a status subscriber may wait for its job to register.
const STATUS_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Point-in-time state of one vertex, as streamed to observers.
#[derive(Debug, Clone)]
pub struct VertexStatus {
    pub digest: Digest,
    pub name: String,
    pub inputs: Vec<Digest>,
    pub started: Option<SystemTime>,
    pub completed: Option<SystemTime>,
}

/// One chunk of process output.
#[derive(Debug, Clone)]
pub struct VertexLog {
    /// 1 = stdout, 2 = stderr.
    pub stream: i64,
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

/// A status message: vertex snapshots and/or log chunks.
#[derive(Debug, Clone, Default)]
pub struct SolveStatus {
    pub vertexes: Vec<VertexStatus>,
    pub logs: Vec<VertexLog>,
}

pub struct SolverOpt {
    pub source_manager: Arc<SourceManager>,
    pub cache_manager: CacheManager,
    pub worker: Arc<dyn Worker>,
}

/// Drives concurrent evaluation of build DAGs and tracks in-flight jobs.
pub struct Solver {
    opt: SolverOpt,
    jobs: Arc<JobList>,
}

impl Solver {
    pub fn new(opt: SolverOpt) -> Self {
        Self { opt, jobs: JobList::new(STATUS_WAIT_TIMEOUT) }
    }

    /// Solve the DAG rooted at `root` under the build id `id`. The job is
    /// observable through [`Solver::status`] for the duration of the call.
    pub async fn solve(&self, id: &str, root: Arc<Vertex>) -> Result<()> {
        let (reader, writer, closer) = progress::pipe();
        let _job = self.jobs.add(id, root.clone(), MultiReader::new(reader))?;

        info!(id, digest = %root.digest(), "starting solve");
        let res = root.solve(&self.opt, &writer).await;
        closer.close();
        res?;

        // No export stage yet: drop the DAG's hold on its snapshots. The
        // committed records stay cached in the manager.
        root.release().await;
        info!(id, "solve finished");
        Ok(())
    }

    /// Stream per-vertex status for an in-flight build into `sender`.
    /// Waits a bounded time for the job to register, then emits the full
    /// topology followed by live events.
    pub async fn status(&self, id: &str, sender: mpsc::Sender<SolveStatus>) -> Result<()> {
        let job = self.jobs.get(id).await?;
        job.pipe(&sender).await
    }
}

#[derive(Default)]
struct VertexState {
    refs: Vec<ImmutableRef>,
    err: Option<Arc<StrataError>>,
    released: bool,
}

/// A node of the build DAG: one operation plus its resolved parents.
pub struct Vertex {
    digest: Digest,
    op: pb::Op,
    inputs: Vec<Arc<Vertex>>,
    state: tokio::sync::Mutex<VertexState>,
    status: std::sync::Mutex<VertexStatus>,
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex").field("digest", &self.digest).finish_non_exhaustive()
    }
}

impl Vertex {
    pub(crate) fn new(digest: Digest, op: pb::Op, inputs: Vec<Arc<Vertex>>) -> Self {
        let name = match &op.op {
            Some(pb::op::Op::Source(s)) => s.identifier.clone(),
            Some(pb::op::Op::Exec(e)) => {
                e.meta.as_ref().map(|m| m.args.join(" ")).unwrap_or_default()
            }
            None => "unknown".to_string(),
        };
        let input_digests = inputs.iter().map(|v| v.digest.clone()).collect();
        let status = VertexStatus {
            digest: digest.clone(),
            name,
            inputs: input_digests,
            started: None,
            completed: None,
        };
        Self {
            digest,
            op,
            inputs,
            state: tokio::sync::Mutex::new(VertexState::default()),
            status: std::sync::Mutex::new(status),
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn name(&self) -> String {
        self.status.lock().unwrap().name.clone()
    }

    pub(crate) fn op(&self) -> &pb::Op {
        &self.op
    }

    pub(crate) fn inputs(&self) -> &[Arc<Vertex>] {
        &self.inputs
    }

    pub(crate) fn status_snapshot(&self) -> VertexStatus {
        self.status.lock().unwrap().clone()
    }

    /// Evaluate this vertex. At most one evaluation runs at a time; a
    /// second caller blocks on the mutex and then observes the terminal
    /// state.
    pub(crate) fn solve<'a>(
        self: &'a Arc<Self>,
        opt: &'a SolverOpt,
        pw: &'a ProgressWriter,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(err) = &state.err {
                return Err(StrataError::Shared(err.clone()));
            }
            if !state.refs.is_empty() {
                return Ok(());
            }
            match self.solve_inner(&mut state, opt, pw).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let err = Arc::new(err);
                    state.err = Some(err.clone());
                    Err(StrataError::Shared(err))
                }
            }
        })
    }

    async fn solve_inner(
        self: &Arc<Self>,
        state: &mut VertexState,
        opt: &SolverOpt,
        pw: &ProgressWriter,
    ) -> Result<()> {
        if !self.inputs.is_empty() {
            // First failure drops the join, cancelling sibling solves.
            try_join_all(self.inputs.iter().map(|input| input.solve(opt, pw))).await?;
        }

        let vertex_pw = pw.child(self.digest.as_str());
        self.notify_started(&vertex_pw);
        let res = match &self.op.op {
            Some(pb::op::Op::Source(src)) => self.run_source(state, src, opt).await,
            Some(pb::op::Op::Exec(exec)) => self.run_exec(state, exec, opt, &vertex_pw).await,
            None => Err(StrataError::InvalidOp { reason: "vertex has no operation".to_string() }),
        };
        self.notify_completed(&vertex_pw);
        res
    }

    async fn run_source(
        &self,
        state: &mut VertexState,
        src: &pb::SourceOp,
        opt: &SolverOpt,
    ) -> Result<()> {
        let attrs: HashMap<String, String> =
            src.attrs.iter().map(|a| (a.key.clone(), a.value.clone())).collect();
        let id = Identifier::from_op(&src.identifier, &attrs)?;
        let snapshot = opt.source_manager.pull(&id).await?;
        state.refs = vec![snapshot];
        Ok(())
    }

    async fn run_exec(
        &self,
        state: &mut VertexState,
        exec: &pb::ExecOp,
        opt: &SolverOpt,
        pw: &ProgressWriter,
    ) -> Result<()> {
        let meta_pb = exec
            .meta
            .as_ref()
            .ok_or_else(|| StrataError::InvalidOp { reason: "exec op has no meta".to_string() })?;
        let meta = Meta {
            args: meta_pb.args.clone(),
            env: meta_pb.env.clone(),
            cwd: if meta_pb.cwd.is_empty() { "/".to_string() } else { meta_pb.cwd.clone() },
        };

        let mut mounts: HashMap<String, Vec<Mount>> = HashMap::new();
        // Output index paired with its scratch snapshot. On any early
        // return the live handles drop and the scratch storage is
        // reclaimed.
        let mut outputs: Vec<(i64, Option<MutableRef>)> = Vec::new();

        for m in &exec.mounts {
            let input_ref = if m.input == EMPTY_INPUT {
                None
            } else {
                Some(self.input_ref(m.input).await?)
            };
            if m.output != SKIP_OUTPUT {
                let active = opt.cache_manager.new_mutable(input_ref.as_ref()).await?;
                mounts.insert(m.dest.clone(), active.mount(false).await?);
                outputs.push((m.output, Some(active)));
            } else {
                let input_ref = input_ref.ok_or_else(|| StrataError::InvalidOp {
                    reason: format!("mount {} has neither input nor output", m.dest),
                })?;
                mounts.insert(m.dest.clone(), input_ref.mount(m.readonly).await?);
            }
        }

        // Each stream gets its own writer slot so log chunks never clobber
        // the vertex status events.
        let mut stdout = StreamWriter { pw: pw.child("stdout"), stream: 1 };
        let mut stderr = StreamWriter { pw: pw.child("stderr"), stream: 2 };
        debug!(digest = %self.digest, args = ?meta.args, "dispatching exec");
        opt.worker
            .exec(&meta, &mounts, &mut stdout, &mut stderr)
            .await
            .map_err(|e| StrataError::Worker { args: meta.args.join(" "), source: e })?;

        // Commit sequentially in output-index order so refs[] is
        // deterministic for chain derivation.
        outputs.sort_by_key(|(index, _)| *index);
        for (want, (index, _)) in outputs.iter().enumerate() {
            if *index != want as i64 {
                return Err(StrataError::InvalidOp {
                    reason: format!("non-contiguous output index {}", index),
                });
            }
        }
        let mut refs = Vec::with_capacity(outputs.len());
        for (_, slot) in outputs.iter_mut() {
            let Some(active) = slot.take() else { continue };
            let id = active.id().to_string();
            let snapshot = active
                .commit()
                .map_err(|e| StrataError::Commit { id, source: Box::new(e) })?;
            refs.push(snapshot);
        }
        state.refs = refs;
        Ok(())
    }

    /// Resolve a mount input to the producing parent's output, by parent
    /// digest identity rather than positional order.
    async fn input_ref(&self, index: i64) -> Result<ImmutableRef> {
        let input = self.op.inputs.get(index as usize).ok_or_else(|| StrataError::InvalidOp {
            reason: format!("input index {} out of range", index),
        })?;
        for parent in &self.inputs {
            if parent.digest.as_str() == input.digest {
                let parent_state = parent.state.lock().await;
                let r = parent_state.refs.get(input.index as usize).ok_or_else(|| {
                    StrataError::InvalidOp {
                        reason: format!("vertex {} has no output {}", parent.digest, input.index),
                    }
                })?;
                return Ok(r.clone());
            }
        }
        Err(StrataError::MissingInput { digest: input.digest.clone() })
    }

    fn notify_started(&self, pw: &ProgressWriter) {
        let status = {
            let mut status = self.status.lock().unwrap();
            status.started = Some(SystemTime::now());
            status.clone()
        };
        let _ = pw.write_with_id(self.digest.as_str(), ProgressEvent::Vertex(status));
    }

    fn notify_completed(&self, pw: &ProgressWriter) {
        let status = {
            let mut status = self.status.lock().unwrap();
            status.completed = Some(SystemTime::now());
            status.clone()
        };
        let _ = pw.write_with_id(self.digest.as_str(), ProgressEvent::Vertex(status));
    }

    /// Release the DAG's snapshot handles, exactly once per vertex. The
    /// handles stay in place so the terminal-state invariant holds for
    /// later solve calls.
    pub(crate) fn release<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for input in &self.inputs {
                input.release().await;
            }
            let mut state = self.state.lock().await;
            if state.released {
                return;
            }
            state.released = true;
            for r in state.refs.iter_mut() {
                r.release_now();
            }
        })
    }
}

/// Wraps every write into a log progress event tagged with a fresh unique
/// id and the stream number.
struct StreamWriter {
    pw: ProgressWriter,
    stream: i64,
}

impl io::Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.pw.write_with_id(
            uuid::Uuid::new_v4().simple().to_string(),
            ProgressEvent::Log(VertexLog {
                stream: self.stream,
                data: buf.to_vec(),
                timestamp: SystemTime::now(),
            }),
        );
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
