//! `join`: obtain an mTLS identity from the orchestrator.
//!
//! The private key is generated here and never leaves the host; only
//! a CSR travels to the orchestrator.

use std::path::Path;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};
use tracing::info;

use crate::client;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

pub async fn run(config: &AgentConfig, token: &str, timeout: Duration) -> AgentResult<()> {
    if token.is_empty() {
        return Err(AgentError::Config("a join token is required".to_string()));
    }

    let key = KeyPair::generate().map_err(|e| AgentError::Cert(format!("generate key: {e}")))?;
    let params = CertificateParams::new(Vec::new())
        .map_err(|e| AgentError::Cert(format!("csr params: {e}")))?;
    let csr = params
        .serialize_request(&key)
        .map_err(|e| AgentError::Cert(format!("build csr: {e}")))?
        .pem()
        .map_err(|e| AgentError::Cert(format!("encode csr: {e}")))?;

    let (cert, ca) = client::join(
        &config.orch_endpoint,
        &config.name,
        token,
        config.advertise_ips.clone(),
        &csr,
        Some(timeout),
    )
    .await?;

    let cert = String::from_utf8(cert).map_err(|_| AgentError::Cert("orch returned a non-PEM cert".into()))?;
    let ca = String::from_utf8(ca).map_err(|_| AgentError::Cert("orch returned a non-PEM CA".into()))?;

    let dir = Path::new(&config.cert_dir);
    super::write_pem(&dir.join("ca.pem"), &ca)?;
    super::write_pem(&dir.join("cert.pem"), &cert)?;
    super::write_pem(&dir.join("cert.key"), &key.serialize_pem())?;

    info!(name = %config.name, dir = %config.cert_dir, "joined, certificate installed");
    Ok(())
}
