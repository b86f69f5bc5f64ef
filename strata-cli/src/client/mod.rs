//! gRPC client for the strata daemon

use anyhow::{Context, Result};
use strata_api::strata::v1::control_client::ControlClient;
use strata_api::strata::v1::*;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// strata gRPC client
#[derive(Clone)]
pub struct StrataClient {
    client: ControlClient<Channel>,
}

impl StrataClient {
    /// Connect to the strata daemon via Unix socket
    pub async fn connect() -> Result<Self> {
        let socket_path =
            std::env::var("STRATA_SOCKET").unwrap_or_else(|_| "/tmp/strata.sock".to_string());

        // Create a dummy URI (required by tonic but not used for Unix sockets)
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(socket_path.clone())
            }))
            .await
            .context("Failed to connect to stratad. Is the daemon running?")?;

        Ok(Self { client: ControlClient::new(channel) })
    }

    /// Submit a build definition
    pub async fn solve(&mut self, id: &str, definition: Definition) -> Result<()> {
        let request = tonic::Request::new(SolveRequest {
            id: id.to_string(),
            definition: Some(definition),
        });
        self.client.solve(request).await?;
        Ok(())
    }

    /// Stream status messages for a build
    pub async fn status(&mut self, id: &str) -> Result<tonic::Streaming<StatusResponse>> {
        let request = tonic::Request::new(StatusRequest { id: id.to_string() });
        let response = self.client.status(request).await?;
        Ok(response.into_inner())
    }

    /// Fetch cache usage records
    pub async fn disk_usage(&mut self) -> Result<Vec<UsageRecord>> {
        let request = tonic::Request::new(DiskUsageRequest {});
        let response = self.client.disk_usage(request).await?;
        Ok(response.into_inner().record)
    }
}
