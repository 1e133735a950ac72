//! `server`: run the agent control surface, FSM and reporter.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use banfleet_api::agent::v1::control::control_service_server::ControlServiceServer;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use crate::client::{ClientTls, OrchClient};
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::fsm::{self, XdpLifecycle};
use crate::notify;
use crate::reporter::Reporter;
use crate::service::ControlGrpc;

pub async fn run(config: &AgentConfig, cancel: CancellationToken) -> AgentResult<()> {
    let addr: SocketAddr = config
        .grpc_addr
        .parse()
        .map_err(|_| AgentError::Config(format!("bad grpc address: {}", config.grpc_addr)))?;

    let tls = if config.insecure {
        info!("TLS disabled, plaintext gRPC");
        None
    } else {
        let dir = Path::new(&config.cert_dir);
        Some(ClientTls {
            ca_pem: super::read_pem(&dir.join("ca.pem"))?,
            cert_pem: super::read_pem(&dir.join("cert.pem"))?,
            key_pem: super::read_pem(&dir.join("cert.key"))?,
        })
    };

    let client = OrchClient::connect(&config.orch_endpoint, tls.as_ref())?;

    let (reporter, reporter_task) = Reporter::new();
    reporter.set_name(&config.name);
    reporter.set_grpc_endpoint(&config.reported_endpoint());

    let lifecycle = XdpLifecycle::new(
        client.clone(),
        PathBuf::from(&config.bpf_object),
        PathBuf::from(&config.bpf_pin_dir),
    );
    // Reports Ready immediately, which completes the required fields
    // and triggers the first upload.
    let fsm = fsm::spawn(lifecycle, reporter.clone(), cancel.clone());

    let interval = Duration::from_secs(config.report_interval_secs.max(1));
    let report_loop = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reporter_task.run(client, interval, cancel).await })
    };

    let mut builder = Server::builder();
    if let Some(tls) = &tls {
        // Only the orchestrator may drive the lifecycle: client certs
        // are mandatory on every method.
        let server_tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem))
            .client_ca_root(Certificate::from_pem(&tls.ca_pem));
        builder = builder.tls_config(server_tls)?;
    }

    info!(addr = %addr, "agent grpc server listening");
    notify::ready();
    notify::status("serving");

    let result = builder
        .add_service(ControlServiceServer::new(ControlGrpc::new(fsm)))
        .serve_with_shutdown(addr, cancel.cancelled())
        .await;

    notify::stopping();
    cancel.cancel();
    let _ = report_loop.await;
    result.map_err(|e| AgentError::Rpc(e.to_string()))
}
