//! Agent lifecycle operations: registration, certificate bootstrap,
//! desired-state edits, status reads.

use std::net::IpAddr;
use std::sync::Arc;

use rand::RngCore;
use tracing::info;

use crate::cert;
use crate::error::{AppError, AppResult};
use crate::model::list::ListMeta;
use crate::model::node::{Agent, AgentInfo, AgentStatus, Registration};
use crate::storage::cert::CertStorage;
use crate::storage::node_info::InfoStorage;
use crate::storage::node_status::StatusStorage;
use crate::storage::register::RegisterStorage;
use crate::storage::StoreError;

pub struct Control {
    registers: RegisterStorage,
    infos: InfoStorage,
    statuses: StatusStorage,
    certs: Arc<CertStorage>,
    cluster_secret: String,
}

impl Control {
    pub fn new(
        registers: RegisterStorage,
        infos: InfoStorage,
        statuses: StatusStorage,
        certs: Arc<CertStorage>,
        cluster_secret: String,
    ) -> Self {
        Self { registers, infos, statuses, certs, cluster_secret }
    }

    /// Create a registration and hand back its one-time token.
    pub async fn register_node(&self, name: &str) -> AppResult<String> {
        let token = generate_token();
        let registration = Registration { name: name.to_string(), token: token.clone() };
        match self.registers.add(&registration).await {
            Ok(()) => Ok(token),
            Err(StoreError::RegisterExists) => Err(AppError::input("node already registered")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn unregister_node(&self, name: &str) -> AppResult<()> {
        self.registers.delete(name).await?;
        Ok(())
    }

    pub async fn list_registration(
        &self,
        page_size: i64,
        cursor: &str,
    ) -> AppResult<(ListMeta, Vec<Registration>)> {
        Ok(self.registers.list(page_size, cursor).await?)
    }

    /// Certificate bootstrap: validate the registration token, sign
    /// the agent CSR, create the default-enabled desired state, and
    /// return the signed certificate plus the CA.
    pub async fn init(
        &self,
        name: &str,
        token: &str,
        ip_addresses: &[IpAddr],
        csr_pem: &str,
    ) -> AppResult<(String, String)> {
        let registration = match self.registers.get(name).await {
            Ok(r) => r,
            Err(StoreError::RegisterNotFound) => return Err(AppError::input("node not registered")),
            Err(err) => return Err(err.into()),
        };
        if registration.token != token {
            return Err(AppError::input("invalid token"));
        }

        let ca_pem = self.certs.ca().await?;
        let sealed_key = self.certs.ca_private().await?;
        let ca_key_pem = cert::open_key(&sealed_key, &self.cluster_secret)?;

        let cert_pem = cert::sign_csr(&ca_pem, &ca_key_pem, name, ip_addresses, csr_pem)?;

        let desired = AgentInfo {
            name: name.to_string(),
            labels: Vec::new(),
            enable: true,
            config: "default".to_string(),
        };
        match self.infos.add(&desired).await {
            Ok(()) => {}
            // A re-joining agent already has desired state; keep it.
            Err(StoreError::InfoExists) => {}
            Err(err) => return Err(err.into()),
        }

        info!(name = %name, "agent initialized");
        Ok((cert_pem, ca_pem))
    }

    pub async fn enable(&self, name: &str, enable: bool) -> AppResult<()> {
        let mut info = self.get_info(name).await?;
        info.enable = enable;
        self.infos.update(&info).await?;
        Ok(())
    }

    pub async fn set_config(&self, name: &str, config: &str) -> AppResult<()> {
        let mut info = self.get_info(name).await?;
        info.config = config.to_string();
        self.infos.update(&info).await?;
        Ok(())
    }

    pub async fn get_config(&self, name: &str) -> AppResult<String> {
        Ok(self.get_info(name).await?.config)
    }

    pub async fn set_labels(&self, name: &str, labels: Vec<String>) -> AppResult<()> {
        let mut info = self.get_info(name).await?;
        info.labels = labels;
        self.infos.update(&info).await?;
        Ok(())
    }

    pub async fn get_labels(&self, name: &str) -> AppResult<Vec<String>> {
        Ok(self.get_info(name).await?.labels)
    }

    pub async fn get_info(&self, name: &str) -> AppResult<AgentInfo> {
        match self.infos.get(name).await {
            Ok(info) => Ok(info),
            Err(StoreError::InfoNotFound) => Err(AppError::not_found("agent info not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_status(&self, name: &str) -> AppResult<AgentStatus> {
        match self.statuses.get(name, false).await {
            Ok(status) => Ok(status),
            Err(StoreError::StatusNotFound) => Err(AppError::not_found("agent status not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn report_status(&self, status: &AgentStatus) -> AppResult<()> {
        self.statuses.update(&status.name, status).await?;
        Ok(())
    }

    pub async fn get_agent(&self, name: &str) -> AppResult<Agent> {
        let info = self.get_info(name).await?;
        let status = self.statuses.get(name, false).await.ok();
        Ok(Agent { info: Some(info), status })
    }

    pub async fn list_agents(&self, page_size: i64, cursor: &str) -> AppResult<(ListMeta, Vec<Agent>)> {
        let (meta, infos) = self.infos.list(page_size, cursor).await?;
        let mut agents = Vec::with_capacity(infos.len());
        for info in infos {
            let status = self.statuses.get(&info.name, false).await.ok();
            agents.push(Agent { info: Some(info), status });
        }
        Ok((meta, agents))
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_32_hex_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
