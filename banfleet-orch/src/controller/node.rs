//! Node controller: drives each agent's XDP lifecycle to match its
//! desired state.

use std::sync::Arc;

use async_trait::async_trait;
use banfleet_api::orch::v1::report::Phase;
use banfleet_cache::{ControllerImpl, StoreReader, SyncError};
use banfleet_kv::{key, Key};
use chrono::Utc;
use tracing::debug;

use crate::controller::client_pool::AgentClientPool;
use crate::model::node::{AgentInfo, AgentStatus};
use crate::storage::{info_key, status_key, AGENT_INFO_DIR, AGENT_STATUS_DIR};

pub struct NodeController {
    pool: Arc<AgentClientPool>,
}

struct Node {
    info: AgentInfo,
    status: AgentStatus,
}

impl NodeController {
    pub fn new(pool: Arc<AgentClientPool>) -> Self {
        Self { pool }
    }

    async fn reconcile(&self, node: &Node) -> Result<(), SyncError> {
        if let Some(error) = &node.status.error {
            if error.retry_at > Utc::now() {
                debug!(
                    node = %node.info.name,
                    error = %error.message,
                    retry_at = %error.retry_at,
                    "agent reported an error, retry window not reached"
                );
                return Err("agent needs retry".into());
            }
        }

        if !node.info.enable {
            return self.stop_node(node).await;
        }
        if is_ready(node) || is_enabled_but_stopped(node) {
            debug!(node = %node.info.name, config = %node.info.config, "starting agent");
            return self.start_node(node).await;
        }
        if needs_reload(node) {
            debug!(
                node = %node.info.name,
                new_config = %node.info.config,
                old_config = %node.status.config,
                "reloading agent"
            );
            return self.reload_node(node).await;
        }
        Ok(())
    }

    async fn stop_node(&self, node: &Node) -> Result<(), SyncError> {
        if node.status.phase != Phase::Stopped.as_status_str() {
            self.pool.stop(&node.status.grpc_endpoint).await?;
        }
        Ok(())
    }

    async fn start_node(&self, node: &Node) -> Result<(), SyncError> {
        self.pool.start(&node.status.grpc_endpoint, &node.info.config).await?;
        Ok(())
    }

    async fn reload_node(&self, node: &Node) -> Result<(), SyncError> {
        self.pool.reload(&node.status.grpc_endpoint, &node.info.config).await?;
        Ok(())
    }
}

fn is_ready(node: &Node) -> bool {
    node.status.phase == Phase::Ready.as_status_str()
}

fn is_enabled_but_stopped(node: &Node) -> bool {
    node.info.enable && node.status.phase == Phase::Stopped.as_status_str()
}

fn needs_reload(node: &Node) -> bool {
    node.status.phase == Phase::Running.as_status_str() && node.status.config != node.info.config
}

#[async_trait]
impl ControllerImpl<String> for NodeController {
    fn listen_prefixes(&self) -> Vec<Key> {
        vec![AGENT_INFO_DIR.to_string(), AGENT_STATUS_DIR.to_string()]
    }

    /// Queue keys are agent names; info and status events for the same
    /// agent collapse into one reconcile.
    fn key_processor(&self, event_key: &str) -> Key {
        key::base(event_key).to_string()
    }

    /// No reconcile action unless both the desired and the reported
    /// state are in the cache.
    async fn sync(&self, name: &str, reader: &StoreReader<String>) -> Result<(), SyncError> {
        let Some(info_raw) = reader.get(&info_key(name)) else {
            debug!(node = %name, "agent info not cached yet, skipping");
            return Ok(());
        };
        let info: AgentInfo = serde_json::from_str(&info_raw)
            .map_err(|e| format!("agent info {name} unmarshal failed: {e}"))?;

        let Some(status_raw) = reader.get(&status_key(name)) else {
            debug!(node = %name, "agent status not cached yet, skipping");
            return Ok(());
        };
        let status: AgentStatus = serde_json::from_str(&status_raw)
            .map_err(|e| format!("agent status {name} unmarshal failed: {e}"))?;

        self.reconcile(&Node { info, status }).await
    }
}
