//! Rule service, including the per-ruleset watch fan-out.
//!
//! Each distinct ruleset gets at most one shared informer, created
//! lazily on the first watch. A new subscriber atomically snapshots
//! the cache and subscribes, so the stream it sees is the snapshot as
//! Add messages followed by every later delta, with no gap and no
//! duplicate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use banfleet_api::orch::v1::rule::rule_service_server::RuleService;
use banfleet_api::orch::v1::rule::*;
use banfleet_cache::{DeltaFifo, EventHandler, Informer, Reflector, Store};
use banfleet_kv::{EtcdClient, Key, ListerWatcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::logic::rules::RuleCenter;
use crate::model::rule::RuleMeta;
use crate::service::convert;
use crate::storage::ruleset_prefix;

const SUBSCRIBER_BUFFER: usize = 1000;
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

struct RegistryEntry {
    informer: Arc<Informer<String>>,
    cancel: CancellationToken,
    subscribers: usize,
}

/// Lazily-created shared informers, one per watched ruleset prefix.
pub struct RuleInformerRegistry {
    client: EtcdClient,
    entries: Mutex<HashMap<Key, RegistryEntry>>,
}

impl RuleInformerRegistry {
    pub fn new(client: EtcdClient) -> Arc<Self> {
        Arc::new(Self { client, entries: Mutex::new(HashMap::new()) })
    }

    fn acquire(&self, prefix: &str) -> Arc<Informer<String>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(prefix) {
            entry.subscribers += 1;
            return entry.informer.clone();
        }

        info!(prefix = %prefix, "creating rule informer");
        let fifo = Arc::new(DeltaFifo::with_wait(1));
        let informer = Informer::new(fifo.clone());
        let lister_watcher: Arc<dyn ListerWatcher<String>> = Arc::new(self.client.clone());
        let reflector = Arc::new(Reflector::new(
            lister_watcher,
            format!("rule_reflector:{prefix}"),
            prefix,
            fifo as Arc<dyn Store<String>>,
        ));

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move { reflector.run(cancel).await });
        }
        {
            let informer = informer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await });
        }

        entries.insert(
            prefix.to_string(),
            RegistryEntry { informer: informer.clone(), cancel, subscribers: 1 },
        );
        informer
    }

    fn release(&self, prefix: &str) {
        let mut entries = self.entries.lock();
        let drained = match entries.get_mut(prefix) {
            Some(entry) => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            None => false,
        };
        if drained {
            info!(prefix = %prefix, "last subscriber gone, stopping rule informer");
            if let Some(entry) = entries.remove(prefix) {
                entry.cancel.cancel();
            }
        }
    }
}

/// Decode a watched value. Rule metadata JSON is forwarded; the bare
/// 10-digit per-CIDR identity records are skipped silently; anything
/// else is noise worth a warning.
fn parse_rule_value(key: &str, raw: &str) -> Option<RuleMeta> {
    if let Ok(meta) = serde_json::from_str::<RuleMeta>(raw) {
        return Some(meta);
    }
    if raw.len() == 10 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return None; // identity record
    }
    warn!(key = %key, "value under rule prefix is neither rule meta nor identity, skipping");
    None
}

fn watch_response(key: &str, meta: &RuleMeta, event: EventType) -> WatchRuleResponse {
    WatchRuleResponse {
        rule_key: key.to_string(),
        rule_meta: Some(convert::rule_meta_to_pb(meta)),
        event: event as i32,
    }
}

struct SubscriberHandler {
    tx: mpsc::Sender<Result<WatchRuleResponse, Status>>,
}

impl SubscriberHandler {
    fn forward(&self, key: &str, raw: &str, event: EventType) {
        let Some(meta) = parse_rule_value(key, raw) else { return };
        if self.tx.try_send(Ok(watch_response(key, &meta, event))).is_err() {
            warn!(key = %key, "rule watch subscriber lagging, event dropped");
        }
    }
}

impl EventHandler<String> for SubscriberHandler {
    fn on_add(&self, key: &str, obj: &String, _is_in_initial_list: bool) {
        self.forward(key, obj, EventType::EventAdd);
    }

    fn on_update(&self, key: &str, _old: &String, new: &String) {
        self.forward(key, new, EventType::EventAdd);
    }

    fn on_delete(&self, key: &str, obj: Option<&String>) {
        match obj {
            Some(raw) => self.forward(key, raw, EventType::EventDelete),
            None => debug!(key = %key, "deletion without last known state, nothing to forward"),
        }
    }
}

pub struct RuleGrpc {
    rules: Arc<RuleCenter>,
    registry: Arc<RuleInformerRegistry>,
}

impl RuleGrpc {
    pub fn new(rules: Arc<RuleCenter>, registry: Arc<RuleInformerRegistry>) -> Self {
        Self { rules, registry }
    }
}

fn required_rule(rule: Option<&RuleInfo>) -> Result<crate::model::rule::RuleInfo, Status> {
    let rule = rule.ok_or_else(|| Status::invalid_argument("rule is required"))?;
    Ok(convert::rule_info_from_pb(rule))
}

#[tonic::async_trait]
impl RuleService for RuleGrpc {
    async fn add_rule(&self, request: Request<AddRuleRequest>) -> Result<Response<AddRuleResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let info = required_rule(req.rule.as_ref())?;
        self.rules
            .add_rule(&req.name, &info, &req.comment, req.duration_seconds)
            .await?;
        Ok(Response::new(AddRuleResponse {}))
    }

    async fn delete_rule(&self, request: Request<DeleteRuleRequest>) -> Result<Response<DeleteRuleResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let info = required_rule(req.rule.as_ref())?;
        self.rules.delete_rule(&req.name, &info).await?;
        Ok(Response::new(DeleteRuleResponse {}))
    }

    async fn update_rule(&self, request: Request<UpdateRuleRequest>) -> Result<Response<UpdateRuleResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let info = required_rule(req.rule.as_ref())?;
        self.rules
            .update_rule(&req.name, &info, &req.comment, req.duration_seconds)
            .await?;
        Ok(Response::new(UpdateRuleResponse {}))
    }

    async fn get_rule(&self, request: Request<GetRuleRequest>) -> Result<Response<GetRuleResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let rules = self.rules.get_rule(&req.name).await?;
        Ok(Response::new(GetRuleResponse {
            rules: rules.iter().map(convert::rule_to_pb).collect(),
        }))
    }

    async fn list_rule(&self, request: Request<ListRuleRequest>) -> Result<Response<ListRuleResponse>, Status> {
        let req = request.into_inner();
        let list = self.rules.list_rule(req.page_size, &req.cursor).await?;
        Ok(Response::new(ListRuleResponse {
            total: list.total_count,
            has_next: list.has_next,
            next_cursor: list.next_cursor,
            items: list
                .items
                .iter()
                .map(|(name, rules)| RulesetRules {
                    name: name.clone(),
                    rules: rules.iter().map(convert::rule_to_pb).collect(),
                })
                .collect(),
        }))
    }

    type WatchRuleResourcesStream = ReceiverStream<Result<WatchRuleResponse, Status>>;

    async fn watch_rule_resources(
        &self,
        request: Request<WatchRuleRequest>,
    ) -> Result<Response<Self::WatchRuleResourcesStream>, Status> {
        let req = request.into_inner();
        if req.rule_name.is_empty() {
            return Err(Status::invalid_argument("rule name is required"));
        }
        let prefix = ruleset_prefix(&req.rule_name);
        info!(prefix = %prefix, "rule watch subscriber connecting");

        let informer = self.registry.acquire(&prefix);
        let never = CancellationToken::new();
        if tokio::time::timeout(CACHE_SYNC_TIMEOUT, informer.wait_for_cache_sync(&never))
            .await
            .is_err()
        {
            self.registry.release(&prefix);
            return Err(Status::unavailable("rule cache did not sync in time"));
        }

        let (event_tx, mut event_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let handler = Arc::new(SubscriberHandler { tx: event_tx });
        let (handler_id, snapshot) =
            informer.register_handler_and_list(vec![prefix.clone()], handler);

        let (out_tx, out_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            // Snapshot first, then the live tail; the informer mutex
            // guarantees every buffered event is newer than the snapshot.
            'stream: {
                for (key, raw) in &snapshot {
                    let Some(meta) = parse_rule_value(key, raw) else { continue };
                    let msg = Ok(watch_response(key, &meta, EventType::EventAdd));
                    if out_tx.send(msg).await.is_err() {
                        break 'stream;
                    }
                }
                while let Some(msg) = event_rx.recv().await {
                    if out_tx.send(msg).await.is_err() {
                        break 'stream;
                    }
                }
            }
            debug!(prefix = %prefix, "rule watch subscriber gone");
            informer.unregister(handler_id);
            registry.release(&prefix);
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn rule_meta_json_is_forwarded() {
        let meta = RuleMeta {
            comment: "block scanner".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            identity: "3009407147".to_string(),
        };
        let raw = meta.marshal();
        let parsed = parse_rule_value("/agent/rule/default/10.0.0.0/24/TCP/0-80", &raw).unwrap();
        assert_eq!(parsed.identity, "3009407147");
    }

    #[test]
    fn identity_records_are_skipped_silently() {
        assert!(parse_rule_value("/agent/rule/default/10.0.0.0/24/", "3009407147").is_none());
    }

    #[test]
    fn ten_digit_comments_still_parse_as_metadata() {
        let meta = RuleMeta {
            comment: "1234567890".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            identity: "1".to_string(),
        };
        assert!(parse_rule_value("/k", &meta.marshal()).is_some());
    }

    #[test]
    fn garbage_values_are_dropped() {
        assert!(parse_rule_value("/k", "not json, not identity").is_none());
        assert!(parse_rule_value("/k", "123").is_none());
    }

    #[test]
    fn wire_event_values_match_the_contract() {
        assert_eq!(EventType::EventAdd as i32, 0);
        assert_eq!(EventType::EventDelete as i32, 1);
    }
}
