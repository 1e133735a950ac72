//! Leased leader election over etcd's campaign primitive.
//!
//! One `Election` per process: it owns a leased session, campaigns in
//! the background, and publishes `BecomeLeader` / `LoseLeader` /
//! `LeaderChanged` to subscribers. The `SingleInstance` supervisor
//! turns those events into at-most-one running controller instance
//! cluster-wide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::LeaderKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::EtcdClient;
use crate::error::KvResult;

const DEFAULT_PREFIX: &str = "election";
const DEFAULT_TTL_SECONDS: i64 = 10;

/// Identity of an orchestrator node, stored as the leader value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub listen_addr: String,
}

impl NodeInfo {
    pub fn marshal(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    BecomeLeader,
    LoseLeader,
    LeaderChanged(NodeInfo),
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub prefix: String,
    pub ttl_seconds: i64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }
}

/// Topic-keyed fan-out of election events. Publish never blocks: a
/// subscriber that cannot keep up loses events.
#[derive(Default)]
pub struct PubSub {
    subscribers: Mutex<HashMap<String, mpsc::Sender<ElectionEvent>>>,
}

impl PubSub {
    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<ElectionEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().insert(topic.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.subscribers.lock().remove(topic);
    }

    pub fn publish(&self, event: ElectionEvent) {
        for (topic, tx) in self.subscribers.lock().iter() {
            if tx.try_send(event.clone()).is_err() {
                warn!(topic = %topic, "election subscriber lagging, event dropped");
            }
        }
    }
}

#[derive(Default)]
struct CampaignState {
    is_leader: bool,
    is_campaigning: bool,
    cancel_campaign: Option<CancellationToken>,
    leader_key: Option<LeaderKey>,
}

pub struct Election {
    client: EtcdClient,
    config: ElectionConfig,
    leader_val: String,
    lease_id: i64,
    cancel: CancellationToken,
    state: Mutex<CampaignState>,
    pubsub: PubSub,
}

impl Election {
    /// Create the leased session, start renewing it, and start the
    /// remote-leader observer.
    pub async fn new(client: EtcdClient, node: NodeInfo, config: ElectionConfig) -> KvResult<Arc<Self>> {
        let lease_id = client
            .grant(Duration::from_secs(config.ttl_seconds as u64))
            .await?;

        let election = Arc::new(Self {
            client,
            config,
            leader_val: node.marshal(),
            lease_id,
            cancel: CancellationToken::new(),
            state: Mutex::new(CampaignState::default()),
            pubsub: PubSub::default(),
        });

        election.spawn_keepalive();
        election.spawn_observer();

        Ok(election)
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<ElectionEvent> {
        self.pubsub.subscribe(topic)
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.pubsub.unsubscribe(topic)
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().is_leader
    }

    /// Start campaigning in the background. Idempotent: a second call
    /// while campaigning or already leader is a no-op. Publishes
    /// `BecomeLeader` once the campaign wins.
    pub fn campaign(self: &Arc<Self>) {
        let cancel = {
            let mut state = self.state.lock();
            if state.is_leader || state.is_campaigning {
                return;
            }
            state.is_campaigning = true;
            let cancel = CancellationToken::new();
            state.cancel_campaign = Some(cancel.clone());
            cancel
        };

        let this = self.clone();
        tokio::spawn(async move {
            let mut election = this.client.raw().election_client();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                _ = this.cancel.cancelled() => None,
                result = election.campaign(this.config.prefix.as_str(), this.leader_val.clone(), this.lease_id) => Some(result),
            };

            let mut state = this.state.lock();
            state.is_campaigning = false;
            match outcome {
                Some(Ok(resp)) => {
                    state.is_leader = true;
                    state.leader_key = resp.leader().cloned();
                    drop(state);
                    info!("campaign won, now leader");
                    this.pubsub.publish(ElectionEvent::BecomeLeader);
                }
                Some(Err(err)) => {
                    drop(state);
                    error!(error = %err, "campaign failed");
                }
                None => {}
            }
        });
    }

    pub fn stop_campaign(&self) {
        let mut state = self.state.lock();
        if !state.is_campaigning {
            return;
        }
        state.is_campaigning = false;
        if let Some(cancel) = state.cancel_campaign.take() {
            cancel.cancel();
        }
        info!("campaign stopped");
    }

    /// Release leadership. A non-leader resign is a no-op unless
    /// `force` is set. Publishes `LoseLeader`.
    pub async fn resign(&self, force: bool) -> KvResult<()> {
        let leader_key = {
            let state = self.state.lock();
            if !force && !state.is_leader {
                return Ok(());
            }
            state.leader_key.clone()
        };

        let mut election = self.client.raw().election_client();
        if let Some(key) = leader_key {
            election
                .resign(Some(etcd_client::ResignOptions::new().with_leader(key)))
                .await?;
        }

        {
            let mut state = self.state.lock();
            state.is_leader = false;
            state.leader_key = None;
        }
        self.pubsub.publish(ElectionEvent::LoseLeader);
        Ok(())
    }

    /// Current leader identity, straight from the store.
    pub async fn leader(&self) -> KvResult<NodeInfo> {
        let mut election = self.client.raw().election_client();
        let resp = election.leader(self.config.prefix.as_str()).await?;
        let value = resp
            .kv()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned())
            .unwrap_or_default();
        serde_json::from_str(&value).map_err(|e| crate::error::KvError::Decode(e.to_string()))
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(err) = self.client.revoke(self.lease_id).await {
            warn!(error = %err, "revoking election lease failed");
        }
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs((this.config.ttl_seconds as u64 / 3).max(1));
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    _ = tick.tick() => {
                        match this.client.keep_alive_once(this.lease_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!("election lease expired");
                                return;
                            }
                            Err(err) => warn!(error = %err, "election lease renewal failed"),
                        }
                    }
                }
            }
        });
    }

    /// Publish `LeaderChanged` for remote leadership changes, skipping
    /// events that carry our own value (campaign handles those).
    fn spawn_observer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut election = this.client.raw().election_client();
            let mut stream = match election.observe(this.config.prefix.as_str()).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = %err, "election observe failed");
                    return;
                }
            };

            loop {
                let message = tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return,
                    Err(err) => {
                        warn!(error = %err, "election observe stream error");
                        return;
                    }
                };

                let Some(kv) = resp.kv() else {
                    debug!("observe event without kv");
                    continue;
                };
                let value = String::from_utf8_lossy(kv.value()).into_owned();
                if value == this.leader_val {
                    continue;
                }
                match serde_json::from_str::<NodeInfo>(&value) {
                    Ok(node) => this.pubsub.publish(ElectionEvent::LeaderChanged(node)),
                    Err(err) => error!(error = %err, "unmarshal leader value failed"),
                }
            }
        });
    }
}

/// A stoppable unit of work gated on leadership.
pub trait Instance: Send {
    fn run(&mut self);
    fn stop(&mut self);
}

/// Runs at most one instance at a time: `run` on `BecomeLeader`,
/// `stop` on `LoseLeader`.
pub struct SingleInstance {
    factory: Box<dyn FnMut() -> Box<dyn Instance> + Send>,
    current: Option<Box<dyn Instance>>,
}

impl SingleInstance {
    pub fn new(factory: impl FnMut() -> Box<dyn Instance> + Send + 'static) -> Self {
        Self { factory: Box::new(factory), current: None }
    }

    pub fn run(&mut self) {
        if self.current.is_some() {
            return;
        }
        let mut instance = (self.factory)();
        instance.run();
        self.current = Some(instance);
    }

    pub fn stop(&mut self) {
        if let Some(mut instance) = self.current.take() {
            instance.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        runs: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl Instance for Probe {
        fn run(&mut self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn single_instance_runs_at_most_one() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let (r, s) = (runs.clone(), stops.clone());
        let mut supervisor =
            SingleInstance::new(move || Box::new(Probe { runs: r.clone(), stops: s.clone() }) as Box<dyn Instance>);

        supervisor.run();
        supervisor.run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        supervisor.stop();
        supervisor.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        supervisor.run();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pubsub_drops_events_for_lagging_subscribers() {
        let pubsub = PubSub::default();
        let mut rx = pubsub.subscribe("t");
        for _ in 0..32 {
            pubsub.publish(ElectionEvent::BecomeLeader);
        }
        // Channel capacity is 16; the rest were dropped, not blocked on.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 16);
    }
}
