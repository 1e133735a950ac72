//! Pooled mTLS connections to agent control endpoints.

use std::time::Duration;

use banfleet_api::agent::v1::control::control_service_client::ControlServiceClient;
use banfleet_api::agent::v1::control::{ReloadRequest, StartRequest, StopRequest};
use dashmap::DashMap;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use crate::error::{AppError, AppResult};

/// Per-call deadline for agent lifecycle RPCs.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client identity used when dialing agents.
#[derive(Debug, Clone)]
pub struct PoolTls {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

pub struct AgentClientPool {
    tls: Option<PoolTls>,
    channels: DashMap<String, Channel>,
}

impl AgentClientPool {
    pub fn new(tls: Option<PoolTls>) -> Self {
        Self { tls, channels: DashMap::new() }
    }

    async fn connect(&self, grpc_endpoint: &str) -> AppResult<ControlServiceClient<Channel>> {
        if let Some(channel) = self.channels.get(grpc_endpoint) {
            return Ok(ControlServiceClient::new(channel.clone()));
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{grpc_endpoint}"))
            .map_err(|e| AppError::input(format!("bad agent endpoint {grpc_endpoint}: {e}")))?
            .timeout(RPC_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(tls) = &self.tls {
            let config = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(&tls.ca_pem))
                .identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem));
            endpoint = endpoint
                .tls_config(config)
                .map_err(|e| AppError::service(format!("agent tls config: {e}")))?;
        }

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| AppError::service(format!("connect to agent {grpc_endpoint}: {e}")))?;
        self.channels.insert(grpc_endpoint.to_string(), channel.clone());
        Ok(ControlServiceClient::new(channel))
    }

    pub async fn start(&self, grpc_endpoint: &str, config_name: &str) -> AppResult<()> {
        let mut client = self.connect(grpc_endpoint).await?;
        client
            .start(StartRequest { config_name: config_name.to_string() })
            .await
            .map_err(|e| AppError::service(format!("start agent {grpc_endpoint}: {e}")))?;
        Ok(())
    }

    pub async fn stop(&self, grpc_endpoint: &str) -> AppResult<()> {
        let mut client = self.connect(grpc_endpoint).await?;
        client
            .stop(StopRequest {})
            .await
            .map_err(|e| AppError::service(format!("stop agent {grpc_endpoint}: {e}")))?;
        Ok(())
    }

    pub async fn reload(&self, grpc_endpoint: &str, config_name: &str) -> AppResult<()> {
        let mut client = self.connect(grpc_endpoint).await?;
        client
            .reload(ReloadRequest { config_name: config_name.to_string() })
            .await
            .map_err(|e| AppError::service(format!("reload agent {grpc_endpoint}: {e}")))?;
        Ok(())
    }

    /// Drop a cached channel, e.g. after repeated failures.
    pub fn evict(&self, grpc_endpoint: &str) {
        self.channels.remove(grpc_endpoint);
    }
}
