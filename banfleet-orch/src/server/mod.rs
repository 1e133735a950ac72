//! gRPC server assembly and the leader-gated controller loop.

pub mod auth_layer;
pub mod leader;

use std::net::SocketAddr;
use std::sync::Arc;

use banfleet_api::orch::v1::auth::auth_service_server::AuthServiceServer;
use banfleet_api::orch::v1::control::control_service_server::ControlServiceServer;
use banfleet_api::orch::v1::orch::orch_service_server::OrchServiceServer;
use banfleet_api::orch::v1::report::report_service_server::ReportServiceServer;
use banfleet_api::orch::v1::rule::rule_service_server::RuleServiceServer;
use banfleet_api::orch::v1::strategy::strategy_service_server::StrategyServiceServer;
use banfleet_kv::EtcdClient;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use crate::logic::Logic;
use crate::service::auth::{AuthGrpc, OperatorCredentials};
use crate::service::control::ControlGrpc;
use crate::service::orch::OrchGrpc;
use crate::service::report::ReportGrpc;
use crate::service::rule::{RuleGrpc, RuleInformerRegistry};
use crate::service::strategy::StrategyGrpc;

/// Server-side TLS material. Client auth is optional at the TLS layer
/// so public methods stay reachable; the auth layer enforces the rest.
pub struct ServerTls {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

pub async fn run_grpc(
    addr: SocketAddr,
    tls: Option<ServerTls>,
    client: EtcdClient,
    logic: Arc<Logic>,
    credentials: OperatorCredentials,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let registry = RuleInformerRegistry::new(client);

    let auth = auth_layer::MtlsAuthLayer::new(ControlGrpc::public_methods());

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        let config = ServerTlsConfig::new()
            .identity(Identity::from_pem(&tls.cert_pem, &tls.key_pem))
            .client_ca_root(Certificate::from_pem(&tls.ca_pem))
            .client_auth_optional(true);
        builder = builder.tls_config(config)?;
    }

    info!(addr = %addr, "grpc server listening");
    builder
        .layer(auth)
        .add_service(ControlServiceServer::new(ControlGrpc::new(logic.control.clone())))
        .add_service(ReportServiceServer::new(ReportGrpc::new(logic.control.clone())))
        .add_service(RuleServiceServer::new(RuleGrpc::new(logic.rules.clone(), registry)))
        .add_service(StrategyServiceServer::new(StrategyGrpc::new(
            logic.strategy.clone(),
            logic.applied.clone(),
        )))
        .add_service(OrchServiceServer::new(OrchGrpc::new(logic.orch_infos.clone())))
        .add_service(AuthServiceServer::new(AuthGrpc::new(credentials)))
        .serve_with_shutdown(addr, cancel.cancelled())
        .await?;

    info!("grpc server stopped");
    Ok(())
}
