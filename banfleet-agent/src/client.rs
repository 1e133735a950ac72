//! gRPC client to the orchestrator.

use std::time::Duration;

use banfleet_api::orch::v1::control::control_service_client::ControlServiceClient;
use banfleet_api::orch::v1::control::InitRequest;
use banfleet_api::orch::v1::report::report_service_client::ReportServiceClient;
use banfleet_api::orch::v1::report::Status as StatusPb;
use banfleet_api::orch::v1::rule::rule_service_client::RuleServiceClient;
use banfleet_api::orch::v1::rule::{WatchRuleRequest, WatchRuleResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{error, info};

use crate::error::{AgentError, AgentResult};

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientTls {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Cloneable handle over one channel to the orchestrator.
#[derive(Clone)]
pub struct OrchClient {
    channel: Channel,
}

impl OrchClient {
    /// Lazy connection: usable before the orchestrator is reachable.
    pub fn connect(endpoint: &str, tls: Option<&ClientTls>) -> AgentResult<Self> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let mut builder = Endpoint::from_shared(format!("{scheme}://{endpoint}"))
            .map_err(|e| AgentError::Config(format!("bad orch endpoint {endpoint}: {e}")))?;
        if let Some(tls) = tls {
            let config = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(&tls.ca_pem))
                .identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem));
            builder = builder.tls_config(config)?;
        }
        Ok(Self { channel: builder.connect_lazy() })
    }

    pub async fn report(&self, status: StatusPb) -> AgentResult<()> {
        let mut client = ReportServiceClient::new(self.channel.clone());
        client.report(status).await?;
        Ok(())
    }

    /// Tail rule events for `ruleset` into `tx` until the stream ends
    /// or `cancel` fires.
    pub async fn watch_rules(
        &self,
        ruleset: &str,
        tx: mpsc::Sender<WatchRuleResponse>,
        cancel: CancellationToken,
    ) -> AgentResult<()> {
        let mut client = RuleServiceClient::new(self.channel.clone());
        let mut stream = client
            .watch_rule_resources(WatchRuleRequest { rule_name: ruleset.to_string() })
            .await?
            .into_inner();

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rule watch cancelled");
                    return Ok(());
                }
                message = stream.message() => message,
            };
            match message {
                Ok(Some(resp)) => {
                    if tx.send(resp).await.is_err() {
                        return Ok(()); // consumer gone
                    }
                }
                Ok(None) => {
                    info!("rule watch stream closed by server");
                    return Ok(());
                }
                Err(status) => {
                    error!(error = %status, "rule watch stream failed");
                    return Err(status.into());
                }
            }
        }
    }
}

/// One-shot certificate bootstrap over an insecure channel: `Init`
/// precedes any client certificate.
pub async fn join(
    endpoint: &str,
    name: &str,
    token: &str,
    ip_addresses: Vec<String>,
    csr_pem: &str,
    timeout: Option<Duration>,
) -> AgentResult<(Vec<u8>, Vec<u8>)> {
    let channel = Endpoint::from_shared(format!("http://{endpoint}"))
        .map_err(|e| AgentError::Config(format!("bad orch endpoint {endpoint}: {e}")))?
        .timeout(timeout.unwrap_or(JOIN_TIMEOUT))
        .connect()
        .await?;

    let mut client = ControlServiceClient::new(channel);
    let resp = client
        .init(InitRequest {
            name: name.to_string(),
            token: token.to_string(),
            ip_addresses,
            csr: csr_pem.as_bytes().to_vec(),
        })
        .await?
        .into_inner();
    Ok((resp.cert, resp.ca))
}
