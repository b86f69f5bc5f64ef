use std::path::PathBuf;
use std::sync::Arc;
use strata_api::strata::v1::control_server::ControlServer;
use strata_core::cache::{CacheManager, CacheManagerOpt};
use strata_core::content::{MemoryContentStore, MemoryLeaseManager};
use strata_core::snapshot::local::DirSnapshotter;
use strata_core::source::local::LocalSource;
use strata_core::worker::local::LocalWorker;
use strata_core::{Config, Solver, SolverOpt, SourceManager};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod control;
mod convert;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("strata daemon starting");

    let config = Config::load()?;
    let root = PathBuf::from(std::env::var("STRATA_ROOT").unwrap_or(config.root_dir));
    std::fs::create_dir_all(root.join("contexts"))?;

    let cache = CacheManager::new(CacheManagerOpt {
        root: root.clone(),
        snapshotter: Arc::new(DirSnapshotter::new(root.join("snapshots"))?),
        content_store: Arc::new(MemoryContentStore::new()),
        lease_manager: Arc::new(MemoryLeaseManager::new()),
        identity_mapping: None,
    })?;

    let sources = SourceManager::new();
    sources.register(Arc::new(LocalSource::new(cache.clone(), root.join("contexts"))));

    let solver = Arc::new(Solver::new(SolverOpt {
        source_manager: Arc::new(sources),
        cache_manager: cache.clone(),
        worker: Arc::new(LocalWorker::new()),
    }));

    let controller = control::Controller::new(solver, cache.clone());

    let socket_path = std::env::var("STRATA_SOCKET").unwrap_or(config.socket_path);
    if std::path::Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path, root = %root.display(), "strata daemon ready");

    Server::builder()
        .add_service(ControlServer::new(controller))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
        })
        .await?;

    // Let scheduled storage teardown settle before exiting.
    cache.flush().await;
    let _ = std::fs::remove_file(&socket_path);
    info!("strata daemon stopped");
    Ok(())
}
