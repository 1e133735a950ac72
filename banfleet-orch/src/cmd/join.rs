//! `join`: pull the cluster CA and issue this node's server cert.

use std::path::Path;

use tracing::info;

use crate::cert;
use crate::config::OrchConfig;
use crate::error::{AppError, AppResult};
use crate::model::node::OrchInfo;
use crate::storage::cert::CertStorage;
use crate::storage::orch_info::OrchInfoStorage;

/// `token` is the cluster secret; it unseals the CA private key.
pub async fn run(config: &OrchConfig, token: &str) -> AppResult<()> {
    if token.is_empty() {
        return Err(AppError::input("a join token is required"));
    }

    let client = super::connect(&config.etcd.client_config()).await?;

    let certs = CertStorage::new(client.clone());
    let ca_pem = certs.ca().await.map_err(AppError::from)?;
    let sealed = certs.ca_private().await.map_err(AppError::from)?;
    let ca_key_pem = cert::open_key(&sealed, token)?;

    let server_cert = cert::issue_cert(&ca_pem, &ca_key_pem, &config.name, &super::localhost_sans())?;

    let dir = Path::new(&config.cert_dir);
    cert::write_pem(&dir.join("ca.pem"), &ca_pem)?;
    cert::write_pem(&dir.join("ca.key"), &ca_key_pem)?;
    cert::write_pem(&dir.join("cert.pem"), &server_cert.cert_pem)?;
    cert::write_pem(&dir.join("cert.key"), &server_cert.key_pem)?;

    OrchInfoStorage::new(client)
        .put(&OrchInfo { name: config.name.clone(), labels: Vec::new() })
        .await
        .map_err(AppError::from)?;

    info!(name = %config.name, "joined the cluster");
    Ok(())
}
