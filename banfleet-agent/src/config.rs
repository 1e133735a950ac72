//! Agent configuration: YAML file with flag overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

pub const AGENT_CERT_DIR: &str = "/etc/banfleet/agent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent name; must match the registration. Defaults to hostname.
    pub name: String,
    /// Orchestrator gRPC endpoint, `host:port`.
    pub orch_endpoint: String,
    /// Local gRPC listen address.
    pub grpc_addr: String,
    /// Endpoint the orchestrator dials back, `host:port`. Defaults to
    /// the listen address.
    pub grpc_endpoint: String,
    /// Addresses to put into the certificate IP SANs.
    pub advertise_ips: Vec<String>,
    pub report_interval_secs: u64,
    pub cert_dir: String,
    /// Pre-built XDP object file.
    pub bpf_object: String,
    /// BPF FS directory for the pinned maps.
    pub bpf_pin_dir: String,
    /// Talk to the orchestrator without TLS; development only.
    pub insecure: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            orch_endpoint: "127.0.0.1:6061".to_string(),
            grpc_addr: "0.0.0.0:6062".to_string(),
            grpc_endpoint: String::new(),
            advertise_ips: Vec::new(),
            report_interval_secs: 15,
            cert_dir: AGENT_CERT_DIR.to_string(),
            bpf_object: "/usr/lib/banfleet/xdp_banner.o".to_string(),
            bpf_pin_dir: crate::xdp::PIN_DIR.to_string(),
            insecure: false,
        }
    }
}

impl AgentConfig {
    pub fn load(path: Option<&Path>) -> AgentResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read config {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("parse config {}: {e}", path.display())))
    }

    /// The endpoint reported to the orchestrator.
    pub fn reported_endpoint(&self) -> String {
        if !self.grpc_endpoint.is_empty() {
            return self.grpc_endpoint.clone();
        }
        self.grpc_addr.clone()
    }
}

pub fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "agent".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_endpoint_prefers_the_explicit_one() {
        let mut config = AgentConfig::default();
        config.grpc_addr = "0.0.0.0:6062".to_string();
        assert_eq!(config.reported_endpoint(), "0.0.0.0:6062");

        config.grpc_endpoint = "10.0.0.5:6062".to_string();
        assert_eq!(config.reported_endpoint(), "10.0.0.5:6062");
    }

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "name: n1\norch_endpoint: orch:6061\nreport_interval_secs: 5\n").unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.name, "n1");
        assert_eq!(config.orch_endpoint, "orch:6061");
        assert_eq!(config.report_interval_secs, 5);
        assert_eq!(config.bpf_pin_dir, crate::xdp::PIN_DIR);
    }
}
