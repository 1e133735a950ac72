//! Leadership loop: campaign, and run the reconciliation engine only
//! while this node holds the lease.

use std::sync::Arc;

use banfleet_kv::election::{Election, ElectionConfig, ElectionEvent, NodeInfo, SingleInstance};
use banfleet_kv::EtcdClient;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::client_pool::AgentClientPool;
use crate::controller::ControllerInstance;
use crate::logic::Logic;

const SUBSCRIBE_TOPIC: &str = "controller";

pub async fn run_controller(
    client: EtcdClient,
    logic: Arc<Logic>,
    pool: Arc<AgentClientPool>,
    node: NodeInfo,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let election = Election::new(client.clone(), node, ElectionConfig::default()).await?;
    let mut events = election.subscribe(SUBSCRIBE_TOPIC);

    let mut supervisor = {
        let client = client.clone();
        let logic = logic.clone();
        let pool = pool.clone();
        SingleInstance::new(move || {
            Box::new(ControllerInstance::new(client.clone(), logic.clone(), pool.clone()))
                as Box<dyn banfleet_kv::election::Instance>
        })
    };

    election.campaign();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(ElectionEvent::BecomeLeader) => {
                    info!("became leader, starting controllers");
                    supervisor.run();
                }
                Some(ElectionEvent::LoseLeader) => {
                    info!("lost leadership, stopping controllers");
                    supervisor.stop();
                }
                Some(ElectionEvent::LeaderChanged(leader)) => {
                    info!(leader = %leader.name, "leader changed");
                }
                None => {
                    error!("election event stream closed");
                    break;
                }
            }
        }
    }

    info!("shutting down controller loop");
    election.unsubscribe(SUBSCRIBE_TOPIC);
    if let Err(err) = election.resign(false).await {
        warn!(error = %err, "resign on shutdown failed, continuing");
    }
    supervisor.stop();
    election.stop_campaign();
    election.close().await;
    Ok(())
}
