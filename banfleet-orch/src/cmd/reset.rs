//! `reset`: wipe the orchestrator's cluster state.

use tracing::{info, warn};

use crate::config::OrchConfig;
use crate::error::{AppError, AppResult};

pub async fn run(config: &OrchConfig, force: bool) -> AppResult<()> {
    if !force {
        return Err(AppError::input(
            "reset deletes every orchestrator record; re-run with --force",
        ));
    }

    let client = super::connect(&config.etcd.client_config()).await?;
    let deleted = client.delete_prefix("/orch/").await.map_err(AppError::from)?
        + client.delete_prefix("election").await.map_err(AppError::from)?;

    warn!(deleted, "orchestrator state cleared");
    info!("agent records were left untouched; clear /agent/ manually if needed");
    Ok(())
}
