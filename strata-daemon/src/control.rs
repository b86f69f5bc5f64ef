//! gRPC control service implementation

use std::sync::Arc;
use strata_api::strata::v1::control_server::Control;
use strata_api::strata::v1::{
    DiskUsageRequest, DiskUsageResponse, SolveRequest, SolveResponse, StatusRequest,
    StatusResponse, UsageRecord,
};
use strata_core::{solver::load, Solver};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

pub struct Controller {
    solver: Arc<Solver>,
    cache: strata_core::CacheManager,
}

impl Controller {
    pub fn new(solver: Arc<Solver>, cache: strata_core::CacheManager) -> Self {
        Self { solver, cache }
    }
}

#[tonic::async_trait]
impl Control for Controller {
    #[instrument(skip(self, request), fields(id = %request.get_ref().id))]
    async fn solve(
        &self,
        request: Request<SolveRequest>,
    ) -> std::result::Result<Response<SolveResponse>, Status> {
        info!("gRPC: Solve");
        let req = request.into_inner();
        let definition =
            req.definition.ok_or_else(|| Status::invalid_argument("definition required"))?;
        let vertex =
            load(&definition.def).map_err(|e| Status::invalid_argument(e.to_string()))?;
        self.solver
            .solve(&req.id, vertex)
            .await
            .map_err(|e| Status::internal(crate::convert::error_chain(&e)))?;
        Ok(Response::new(SolveResponse {}))
    }

    type StatusStream = ReceiverStream<std::result::Result<StatusResponse, Status>>;

    #[instrument(skip(self, request), fields(id = %request.get_ref().id))]
    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> std::result::Result<Response<Self::StatusStream>, Status> {
        info!("gRPC: Status");
        let id = request.into_inner().id;
        let (out_tx, out_rx) = mpsc::channel(32);
        let solver = self.solver.clone();

        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(32);
            let streamer = {
                let solver = solver.clone();
                let id = id.clone();
                tokio::spawn(async move { solver.status(&id, tx).await })
            };
            while let Some(status) = rx.recv().await {
                if out_tx.send(Ok(crate::convert::solve_status(&status))).await.is_err() {
                    // Subscriber went away; dropping rx cancels the pipe.
                    break;
                }
            }
            match streamer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(id, error = %e, "status stream failed");
                    let _ = out_tx.send(Err(Status::not_found(e.to_string()))).await;
                }
                Err(e) => warn!(id, error = %e, "status task panicked"),
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    #[instrument(skip(self, _request))]
    async fn disk_usage(
        &self,
        _request: Request<DiskUsageRequest>,
    ) -> std::result::Result<Response<DiskUsageResponse>, Status> {
        let usage = self.cache.disk_usage().await.map_err(|e| Status::internal(e.to_string()))?;
        let record = usage
            .into_iter()
            .map(|u| UsageRecord { id: u.id, mutable: u.mutable, in_use: u.in_use, size: u.size })
            .collect();
        Ok(Response::new(DiskUsageResponse { record }))
    }
}
