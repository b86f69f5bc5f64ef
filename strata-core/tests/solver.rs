//! End-to-end solver behavior over real temp-dir storage.

mod common;

use common::{error_chain, rig, CountingSource, RecordingWorker};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strata_core::llb;
use strata_core::solver::{load, SolveStatus, Solver, SolverOpt};
use strata_core::source::SourceManager;
use strata_core::StrataError;
use tokio::sync::mpsc;

fn diamond() -> llb::Definition {
    let base = llb::image("alpine:3.19");
    let b = base.run(["step-b"]).build().root();
    let c = base.run(["step-c"]).build().root();
    b.run(["step-d"]).mount_readonly("/c", &c).build().root().marshal().unwrap()
}

fn solver_with(
    rig: &common::Rig,
    source: Arc<CountingSource>,
    worker: Arc<RecordingWorker>,
) -> Solver {
    let sources = SourceManager::new();
    sources.register(source);
    Solver::new(SolverOpt {
        source_manager: Arc::new(sources),
        cache_manager: rig.cache.clone(),
        worker,
    })
}

#[tokio::test]
async fn test_diamond_solves_each_vertex_once() {
    let rig = rig();
    let source = Arc::new(CountingSource::new(rig.cache.clone()));
    let worker = Arc::new(RecordingWorker::new());
    let solver = solver_with(&rig, source.clone(), worker.clone());

    let root = load(&diamond().def).unwrap();
    solver.solve("build-1", root).await.unwrap();

    // The shared base pulled exactly once, three exec dispatches.
    assert_eq!(source.pulls(), 1);
    let execs = worker.execs();
    assert_eq!(execs.len(), 3);

    // D saw both parents: its own writable root plus C's read-only mount.
    let d = execs.iter().find(|e| e.args == ["step-d"]).unwrap();
    assert_eq!(d.dests, vec!["/", "/c"]);

    // Everything the solve allocated was settled; only committed records
    // remain and nothing mutable leaks.
    rig.cache.flush().await;
    let usage = rig.cache.disk_usage().await.unwrap();
    assert!(usage.iter().all(|u| !u.mutable), "leaked mutable records: {:?}", usage);
}

#[tokio::test]
async fn test_failure_propagates_and_cleans_up() {
    let rig = rig();
    let source = Arc::new(CountingSource::new(rig.cache.clone()));
    // C fails fast with "boom"; B stalls so cancellation reaps it.
    let worker = Arc::new(RecordingWorker::failing_on("step-c").stalling_on("step-b"));
    let solver = solver_with(&rig, source.clone(), worker.clone());

    let root = load(&diamond().def).unwrap();
    let err = solver.solve("build-fail", root).await.unwrap_err();
    assert!(error_chain(&err).contains("boom"), "unexpected error: {}", error_chain(&err));

    // D's exec never ran.
    let execs = worker.execs();
    assert!(execs.iter().all(|e| e.args != ["step-d"]));

    // Every scratch snapshot allocated for the failed or cancelled execs
    // was released.
    rig.cache.flush().await;
    let usage = rig.cache.disk_usage().await.unwrap();
    assert!(usage.iter().all(|u| !u.mutable), "leaked mutable records: {:?}", usage);
}

#[tokio::test]
async fn test_failure_is_sticky() {
    let rig = rig();
    let source = Arc::new(CountingSource::new(rig.cache.clone()));
    let worker = Arc::new(RecordingWorker::failing_on("step-c"));
    let solver = solver_with(&rig, source.clone(), worker.clone());

    let root = load(&diamond().def).unwrap();
    let first = solver.solve("a", root.clone()).await.unwrap_err();
    let before = worker.execs().len();

    let second = solver.solve("b", root).await.unwrap_err();
    assert!(error_chain(&second).contains("boom"));
    assert!(error_chain(&first).contains("boom"));
    // No retry happened for the failed vertex.
    assert_eq!(worker.execs().iter().filter(|e| e.args == ["step-c"]).count(), 1);
    assert!(worker.execs().len() >= before);
}

#[tokio::test]
async fn test_concurrent_solves_share_evaluation() {
    let rig = rig();
    let source =
        Arc::new(CountingSource::with_delay(rig.cache.clone(), Duration::from_millis(50)));
    let worker = Arc::new(RecordingWorker::new());
    let solver = Arc::new(solver_with(&rig, source.clone(), worker.clone()));

    let root = load(&diamond().def).unwrap();
    let s1 = solver.clone();
    let s2 = solver.clone();
    let r1 = root.clone();
    let r2 = root.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { s1.solve("caller-1", r1).await }),
        tokio::spawn(async move { s2.solve("caller-2", r2).await }),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    // Each vertex evaluated at most once across both callers.
    assert_eq!(source.pulls(), 1);
    assert_eq!(worker.execs().len(), 3);
}

#[tokio::test]
async fn test_duplicate_job_id_rejected() {
    let rig = rig();
    let source =
        Arc::new(CountingSource::with_delay(rig.cache.clone(), Duration::from_millis(200)));
    let worker = Arc::new(RecordingWorker::new());
    let solver = Arc::new(solver_with(&rig, source, worker));

    let root = load(&diamond().def).unwrap();
    let s1 = solver.clone();
    let r1 = root.clone();
    let running = tokio::spawn(async move { s1.solve("same-id", r1).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = solver.solve("same-id", root).await.unwrap_err();
    assert!(matches!(err, StrataError::DuplicateJob { .. }));
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_status_subscriber_ahead_of_solve() {
    let rig = rig();
    // The slow source keeps the solve in its first vertex until the
    // status subscriber is attached.
    let source =
        Arc::new(CountingSource::with_delay(rig.cache.clone(), Duration::from_millis(100)));
    let worker = Arc::new(RecordingWorker::new());
    let solver = Arc::new(solver_with(&rig, source, worker));

    // Subscribe before the job exists; the registry holds the call until
    // registration.
    let (tx, mut rx) = mpsc::channel::<SolveStatus>(256);
    let s2 = solver.clone();
    let status = tokio::spawn(async move { s2.status("raced", tx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let root = load(&diamond().def).unwrap();
    solver.solve("raced", root).await.unwrap();
    status.await.unwrap().unwrap();

    let mut messages = Vec::new();
    while let Some(m) = rx.recv().await {
        messages.push(m);
    }

    // The initial walk emits the full topology, one message per unique
    // vertex digest, before any live event.
    let initial: Vec<_> = messages.iter().take(4).collect();
    let digests: HashSet<_> =
        initial.iter().flat_map(|m| m.vertexes.iter().map(|v| v.digest.clone())).collect();
    assert_eq!(digests.len(), 4);
    assert!(initial.iter().all(|m| m.vertexes.len() == 1));

    // Live events carry timestamps and logs arrive on stream 1.
    assert!(messages
        .iter()
        .skip(4)
        .any(|m| m.vertexes.iter().any(|v| v.started.is_some() && v.completed.is_some())));
    assert!(messages.iter().any(|m| m.logs.iter().any(|l| l.stream == 1)));
}

#[tokio::test]
async fn test_status_unknown_job_times_out() {
    let rig = rig();
    let source = Arc::new(CountingSource::new(rig.cache.clone()));
    let worker = Arc::new(RecordingWorker::new());
    let solver = solver_with(&rig, source, worker);

    let (tx, _rx) = mpsc::channel::<SolveStatus>(8);
    let err = solver.status("never-registered", tx).await.unwrap_err();
    assert!(matches!(err, StrataError::NoSuchJob { .. }));
}

#[tokio::test]
async fn test_unknown_scheme_fails_the_build() {
    let rig = rig();
    let source = Arc::new(CountingSource::new(rig.cache.clone()));
    let worker = Arc::new(RecordingWorker::new());
    let solver = solver_with(&rig, source, worker);

    let def = llb::source("git://example.com/repo").marshal().unwrap();
    let root = load(&def.def).unwrap();
    let err = solver.solve("no-git", root).await.unwrap_err();
    assert!(error_chain(&err).contains("no source registered"));
}
