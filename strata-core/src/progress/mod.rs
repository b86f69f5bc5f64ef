//! Progress pub/sub for in-flight builds.
//!
//! A lazy latest-value bus: every writer handle owns a single slot holding
//! its most recent event, and readers observe the latest event per writer
//! rather than a queue of every write. One shared notifier wakes all
//! readers on any write. The bus is closed through the closer handle
//! returned by [`pipe`]; readers then drain remaining unseen events and
//! return end-of-stream.

use crate::error::{Result, StrataError};
use crate::solver::{VertexLog, VertexStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

/// A single progress event.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Vertex(VertexStatus),
    Log(VertexLog),
}

/// An event as observed by readers: the payload plus the writer-assigned
/// id, timestamp, and done marker.
#[derive(Debug, Clone)]
pub struct Progress {
    pub id: String,
    pub timestamp: SystemTime,
    pub done: bool,
    pub event: ProgressEvent,
}

struct WriterState {
    latest: Mutex<Option<Arc<Progress>>>,
    /// Bumped after every store of `latest`; readers compare against the
    /// sequence they last saw.
    seq: AtomicU64,
    done: AtomicBool,
}

struct BusShared {
    writers: Mutex<Vec<Arc<WriterState>>>,
    notify: Notify,
    /// Bumped on every write, writer registration, and close, so readers
    /// can re-check without losing wakeups.
    version: AtomicU64,
    closed: AtomicBool,
}

impl BusShared {
    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// Create a connected reader/writer pair plus the closer that ends the
/// stream. The writer has an empty id; derive per-component writers with
/// [`ProgressWriter::child`].
pub fn pipe() -> (ProgressReader, ProgressWriter, ProgressCloser) {
    let bus = Arc::new(BusShared {
        writers: Mutex::new(Vec::new()),
        notify: Notify::new(),
        version: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    let writer = ProgressWriter::register(&bus, String::new());
    let reader = ProgressReader { bus: bus.clone(), cursor: 0, handles: Vec::new() };
    (reader, writer, ProgressCloser { bus })
}

/// Closes the bus when invoked or dropped.
pub struct ProgressCloser {
    bus: Arc<BusShared>,
}

impl ProgressCloser {
    pub fn close(self) {
        // Drop performs the close.
    }
}

impl Drop for ProgressCloser {
    fn drop(&mut self) {
        self.bus.closed.store(true, Ordering::Release);
        self.bus.bump();
    }
}

/// Writer handle. Cloning shares the same slot; `child` creates a new slot
/// with a dotted-prefix id.
#[derive(Clone)]
pub struct ProgressWriter {
    id: String,
    inner: Option<(Arc<BusShared>, Arc<WriterState>)>,
}

impl ProgressWriter {
    fn register(bus: &Arc<BusShared>, id: String) -> Self {
        let state = Arc::new(WriterState {
            latest: Mutex::new(None),
            seq: AtomicU64::new(0),
            done: AtomicBool::new(false),
        });
        bus.writers.lock().unwrap().push(state.clone());
        bus.bump();
        Self { id, inner: Some((bus.clone(), state)) }
    }

    /// A writer that swallows every event. Substitutable wherever no one
    /// is listening.
    pub fn discard() -> Self {
        Self { id: String::new(), inner: None }
    }

    /// Derive a writer for a sub-component. Ids nest with dots.
    pub fn child(&self, name: &str) -> ProgressWriter {
        let id = if self.id.is_empty() { name.to_string() } else { format!("{}.{}", self.id, name) };
        match &self.inner {
            Some((bus, _)) => ProgressWriter::register(bus, id),
            None => ProgressWriter::discard(),
        }
    }

    /// Publish an event under this writer's id.
    pub fn write(&self, event: ProgressEvent) -> Result<()> {
        self.write_with_id(self.id.clone(), event)
    }

    /// Publish an event under an explicit id (used for per-chunk log
    /// events that each carry a fresh id).
    pub fn write_with_id(&self, id: impl Into<String>, event: ProgressEvent) -> Result<()> {
        let Some((bus, state)) = &self.inner else { return Ok(()) };
        if state.done.load(Ordering::Acquire) {
            return Err(StrataError::Internal(format!(
                "writing to closed progress writer {}",
                self.id
            )));
        }
        let progress =
            Arc::new(Progress { id: id.into(), timestamp: SystemTime::now(), done: false, event });
        *state.latest.lock().unwrap() = Some(progress);
        state.seq.fetch_add(1, Ordering::AcqRel);
        bus.bump();
        Ok(())
    }

    /// Mark this writer finished: republishes the latest event flagged
    /// done. Writes after this error.
    pub fn done(&self) -> Result<()> {
        let Some((bus, state)) = &self.inner else { return Ok(()) };
        let mut latest = state.latest.lock().unwrap();
        if let Some(last) = latest.as_ref() {
            if last.done {
                return Ok(());
            }
            let mut p = (**last).clone();
            p.done = true;
            *latest = Some(Arc::new(p));
            state.seq.fetch_add(1, Ordering::AcqRel);
        }
        state.done.store(true, Ordering::Release);
        drop(latest);
        bus.bump();
        Ok(())
    }
}

struct StreamHandle {
    writer: Arc<WriterState>,
    seen: u64,
}

/// Reader half of the bus. `read` yields the next unseen latest event,
/// waiting when everything has been observed, and returns `None` once the
/// bus is closed and drained.
pub struct ProgressReader {
    bus: Arc<BusShared>,
    cursor: usize,
    handles: Vec<StreamHandle>,
}

impl ProgressReader {
    pub async fn read(&mut self) -> Option<Arc<Progress>> {
        loop {
            let version = self.bus.version.load(Ordering::Acquire);

            // Adopt writers registered since the last scan.
            {
                let writers = self.bus.writers.lock().unwrap();
                while self.cursor < writers.len() {
                    self.handles
                        .push(StreamHandle { writer: writers[self.cursor].clone(), seen: 0 });
                    self.cursor += 1;
                }
            }

            for handle in self.handles.iter_mut() {
                let seq = handle.writer.seq.load(Ordering::Acquire);
                if seq != handle.seen {
                    handle.seen = seq;
                    if let Some(p) = handle.writer.latest.lock().unwrap().clone() {
                        return Some(p);
                    }
                }
            }

            if self.bus.closed.load(Ordering::Acquire) {
                return None;
            }

            // Register for a wakeup, then re-check the version so a write
            // racing the scan is never lost.
            let notified = self.bus.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.bus.version.load(Ordering::Acquire) != version {
                continue;
            }
            notified.await;
        }
    }
}

/// Fans one reader out to any number of subscriber channels, each
/// receiving a copy of every emitted event.
#[derive(Clone)]
pub struct MultiReader {
    inner: Arc<MultiReaderInner>,
}

struct MultiReaderInner {
    subs: Mutex<Vec<mpsc::UnboundedSender<Arc<Progress>>>>,
    finished: AtomicBool,
}

impl MultiReader {
    pub fn new(mut reader: ProgressReader) -> Self {
        let inner = Arc::new(MultiReaderInner {
            subs: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        });
        let pump = inner.clone();
        tokio::spawn(async move {
            while let Some(p) = reader.read().await {
                pump.subs.lock().unwrap().retain(|tx| tx.send(p.clone()).is_ok());
            }
            pump.finished.store(true, Ordering::Release);
            // Dropping the senders ends every subscriber stream.
            pump.subs.lock().unwrap().clear();
            debug!("progress stream closed");
        });
        Self { inner }
    }

    /// Subscribe. Events published before subscription are not replayed.
    pub fn reader(&self) -> mpsc::UnboundedReceiver<Arc<Progress>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.finished.load(Ordering::Acquire) {
            self.inner.subs.lock().unwrap().push(tx);
        }
        rx
    }
}
