//! Orchestrator configuration: YAML file with flag overrides.

use std::path::Path;

use banfleet_kv::EtcdConfig;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdSection {
    pub endpoints: Vec<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for EtcdSection {
    fn default() -> Self {
        let defaults = EtcdConfig::default();
        Self {
            endpoints: defaults.endpoints,
            request_timeout_ms: defaults.request_timeout_ms,
            connect_timeout_ms: defaults.connect_timeout_ms,
        }
    }
}

impl EtcdSection {
    pub fn client_config(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.endpoints.clone(),
            request_timeout_ms: self.request_timeout_ms,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorSection {
    pub username: String,
    pub password: String,
    pub jwt_secret: String,
}

impl Default for OperatorSection {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: String::new(),
            jwt_secret: "banfleet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchConfig {
    /// Node name; defaults to the hostname.
    pub name: String,
    pub grpc_addr: String,
    pub etcd: EtcdSection,
    /// Secret sealing the cluster CA key.
    pub cluster_secret: String,
    pub cert_dir: String,
    pub operator: OperatorSection,
    /// Serve without TLS; development only.
    pub insecure: bool,
}

impl Default for OrchConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            grpc_addr: "0.0.0.0:6061".to_string(),
            etcd: EtcdSection::default(),
            cluster_secret: String::new(),
            cert_dir: crate::cert::ORCH_CERT_DIR.to_string(),
            operator: OperatorSection::default(),
            insecure: false,
        }
    }
}

impl OrchConfig {
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::input(format!("read config {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| AppError::input(format!("parse config {}: {e}", path.display())))
    }
}

pub fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "orch".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orch.yaml");
        std::fs::write(
            &path,
            "name: orch-a\ngrpc_addr: 127.0.0.1:7070\netcd:\n  endpoints: [\"http://etcd:2379\"]\n",
        )
        .unwrap();

        let config = OrchConfig::load(Some(&path)).unwrap();
        assert_eq!(config.name, "orch-a");
        assert_eq!(config.grpc_addr, "127.0.0.1:7070");
        assert_eq!(config.etcd.endpoints, vec!["http://etcd:2379".to_string()]);
        // Untouched sections keep their defaults.
        assert_eq!(config.operator.username, "admin");
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let err = OrchConfig::load(Some(Path::new("/nonexistent/orch.yaml"))).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Input);
    }
}
