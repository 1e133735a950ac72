//! `server`: run the gRPC surface and the leader-gated controllers.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use banfleet_kv::election::NodeInfo;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::OrchConfig;
use crate::controller::client_pool::{AgentClientPool, PoolTls};
use crate::error::{AppError, AppResult};
use crate::logic::Logic;
use crate::model::node::OrchInfo;
use crate::server::{self, ServerTls};
use crate::service::auth::OperatorCredentials;

pub async fn run(config: &OrchConfig, cancel: CancellationToken) -> AppResult<()> {
    let addr: SocketAddr = config
        .grpc_addr
        .parse()
        .map_err(|_| AppError::input(format!("bad grpc address: {}", config.grpc_addr)))?;

    let client = super::connect(&config.etcd.client_config()).await?;
    let logic = Arc::new(Logic::new(
        client.clone(),
        config.cluster_secret.clone(),
        cancel.clone(),
    ));

    let (server_tls, pool_tls) = if config.insecure {
        info!("TLS disabled, serving plaintext gRPC");
        (None, None)
    } else {
        let dir = Path::new(&config.cert_dir);
        let ca_pem = read_pem(&dir.join("ca.pem"))?;
        let cert_pem = read_pem(&dir.join("cert.pem"))?;
        let key_pem = read_pem(&dir.join("cert.key"))?;
        (
            Some(ServerTls {
                ca_pem: ca_pem.clone(),
                cert_pem: cert_pem.clone(),
                key_pem: key_pem.clone(),
            }),
            Some(PoolTls { ca_pem, cert_pem, key_pem }),
        )
    };

    logic
        .orch_infos
        .put(&OrchInfo { name: config.name.clone(), labels: Vec::new() })
        .await
        .map_err(AppError::from)?;

    let pool = Arc::new(AgentClientPool::new(pool_tls));
    let node = NodeInfo { name: config.name.clone(), listen_addr: config.grpc_addr.clone() };

    let controller = {
        let client = client.clone();
        let logic = logic.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = server::leader::run_controller(client, logic, pool, node, cancel).await {
                error!(error = %err, "controller loop failed");
            }
        })
    };

    let credentials = OperatorCredentials {
        username: config.operator.username.clone(),
        password: config.operator.password.clone(),
        jwt_secret: config.operator.jwt_secret.clone(),
    };
    let serve = server::run_grpc(addr, server_tls, client, logic, credentials, cancel.clone());

    // The server and the controller loop both run to completion before
    // the command returns.
    let result = serve.await;
    cancel.cancel();
    let _ = controller.await;
    result.map_err(|e| AppError::service(e.to_string()))
}

fn read_pem(path: &Path) -> AppResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| AppError::service(format!("read {}: {e} (did you run init/join?)", path.display())))
}
