//! Strategy controller: executes applied strategies against their
//! target agents, then archives them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use banfleet_cache::{ControllerImpl, StoreReader, SyncError};
use banfleet_kv::Key;
use tracing::debug;

use crate::logic::control::Control;
use crate::logic::strategy::AppliedLogic;
use crate::model::strategy::{Applied, AppliedStatus, StrategyAction};
use crate::storage::APPLIED_RUNNING_DIR;

/// Deadline per agent operation while executing an applied strategy.
const PER_AGENT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct StrategyController {
    control: Arc<Control>,
    applied: Arc<AppliedLogic>,
}

impl StrategyController {
    pub fn new(control: Arc<Control>, applied: Arc<AppliedLogic>) -> Self {
        Self { control, applied }
    }

    async fn reconcile(&self, applied: &mut Applied) {
        match applied.action {
            StrategyAction::Config => self.apply_config(applied).await,
            StrategyAction::Enable => self.apply_enable(applied).await,
        }
    }

    async fn apply_config(&self, applied: &mut Applied) {
        let config = applied.value.clone();
        let mut all_success = true;
        for agent in applied.agents.clone() {
            let result = tokio::time::timeout(
                PER_AGENT_TIMEOUT,
                self.control.set_config(&agent, &config),
            )
            .await;
            if let Err(message) = flatten(result) {
                all_success = false;
                applied
                    .errors
                    .push(format!("set config on agent {agent} failed: {message}"));
            }
        }
        applied.status = if all_success { AppliedStatus::Success } else { AppliedStatus::Failed };
    }

    async fn apply_enable(&self, applied: &mut Applied) {
        let enable = match applied.value.parse::<bool>() {
            Ok(enable) => enable,
            Err(err) => {
                applied.status = AppliedStatus::Failed;
                applied
                    .errors
                    .push(format!("parse enable value {:?} failed: {err}", applied.value));
                return;
            }
        };

        let mut all_success = true;
        for agent in applied.agents.clone() {
            let result =
                tokio::time::timeout(PER_AGENT_TIMEOUT, self.control.enable(&agent, enable)).await;
            if let Err(message) = flatten(result) {
                all_success = false;
                applied
                    .errors
                    .push(format!("enable agent {agent} failed: {message}"));
            }
        }
        applied.status = if all_success { AppliedStatus::Success } else { AppliedStatus::Failed };
    }
}

fn flatten<T, E: std::fmt::Display>(
    result: Result<Result<T, E>, tokio::time::error::Elapsed>,
) -> Result<T, String> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("deadline exceeded".to_string()),
    }
}

#[async_trait]
impl ControllerImpl<String> for StrategyController {
    fn listen_prefixes(&self) -> Vec<Key> {
        vec![APPLIED_RUNNING_DIR.to_string()]
    }

    async fn sync(&self, event_key: &str, reader: &StoreReader<String>) -> Result<(), SyncError> {
        let Some(raw) = reader.get(event_key) else {
            return Ok(()); // already archived
        };
        let mut applied = Applied::unmarshal(&raw)
            .map_err(|e| format!("unmarshal applied {event_key} failed: {e}"))?;

        if applied.status.is_terminal() {
            debug!(applied = %applied.name, "skipping archived applied");
            return Ok(());
        }

        self.reconcile(&mut applied).await;

        // Put into history, then drop from running. A crash in between
        // is safe: the re-run reconciles to the same terminal state and
        // the history put tolerates the existing record.
        self.applied
            .move_to_history(&applied)
            .await
            .map_err(|e| -> SyncError { format!("archive applied {}: {e}", applied.name).into() })?;
        Ok(())
    }
}
