//! `init`: bootstrap the cluster CA and announce this orchestrator.

use std::path::Path;

use tracing::info;

use crate::cert;
use crate::config::OrchConfig;
use crate::error::{AppError, AppResult};
use crate::model::node::OrchInfo;
use crate::storage::cert::CertStorage;
use crate::storage::orch_info::OrchInfoStorage;

pub async fn run(config: &OrchConfig) -> AppResult<()> {
    if config.cluster_secret.is_empty() {
        return Err(AppError::input("a cluster secret is required to seal the CA key"));
    }

    let client = super::connect(&config.etcd.client_config()).await?;

    let ca = cert::create_ca("banfleet-ca")?;
    let sealed = cert::seal_key(&ca.key_pem, &config.cluster_secret)?;

    let certs = CertStorage::new(client.clone());
    certs.init(&ca.cert_pem, &sealed).await.map_err(AppError::from)?;

    let server_cert =
        cert::issue_cert(&ca.cert_pem, &ca.key_pem, &config.name, &super::localhost_sans())?;

    let dir = Path::new(&config.cert_dir);
    cert::write_pem(&dir.join("ca.pem"), &ca.cert_pem)?;
    cert::write_pem(&dir.join("ca.key"), &ca.key_pem)?;
    cert::write_pem(&dir.join("cert.pem"), &server_cert.cert_pem)?;
    cert::write_pem(&dir.join("cert.key"), &server_cert.key_pem)?;

    OrchInfoStorage::new(client)
        .put(&OrchInfo { name: config.name.clone(), labels: Vec::new() })
        .await
        .map_err(AppError::from)?;

    info!(name = %config.name, dir = %config.cert_dir, "cluster initialized");
    Ok(())
}
