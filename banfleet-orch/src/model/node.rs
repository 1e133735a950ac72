use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::list::ListMeta;

/// Pairing an operator created for an agent; consumed once at `Init`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub token: String,
}

/// Desired state for an agent, written by operators and strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub enable: bool,
    pub config: String,
}

/// Last callback failure on the agent, with the retry horizon the node
/// controller honors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTime {
    pub message: String,
    pub retry_at: DateTime<Utc>,
}

/// Reported state of an agent. Stored under a lease: the key's
/// absence means the agent is dead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    pub grpc_endpoint: String,
    #[serde(default)]
    pub config: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Agent {
    pub info: Option<AgentInfo>,
    pub status: Option<AgentStatus>,
}

/// Orchestrator cluster membership record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchInfo {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentList {
    #[serde(flatten)]
    pub meta: ListMeta,
    pub items: Vec<Agent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationList {
    #[serde(flatten)]
    pub meta: ListMeta,
    pub items: Vec<Registration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchInfoList {
    #[serde(flatten)]
    pub meta: ListMeta,
    pub items: Vec<OrchInfo>,
}
