//! Transactional rule storage with stable per-CIDR identities.

use std::sync::Arc;

use banfleet_kv::{Compare, CompareOp, EtcdClient, PutOptions, Txn, TxnOp};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::rule::{Rule, RuleInfo, RuleList, RuleMeta};
use crate::storage::{
    identity_key, rule_key, ruleset_prefix, StoreError, StoreResult, RULE_DIR, RULE_NAMES_KEY,
};

/// Concurrent ruleset fetches during a paged list.
const LIST_FETCH_CONCURRENCY: usize = 10;

#[derive(Clone)]
pub struct RuleStorage {
    client: EtcdClient,
    /// Serializes every mutation: the names index and the identity key
    /// are shared state a concurrent add/delete would race on.
    op_lock: Arc<Mutex<()>>,
}

impl RuleStorage {
    pub fn new(client: EtcdClient) -> Self {
        Self { client, op_lock: Arc::new(Mutex::new(())) }
    }

    /// Create a rule. The rule key and the identity key are written in
    /// one transaction, leased until the rule's expiry; the ruleset
    /// name is appended to the names index when new.
    pub async fn add(&self, ruleset: &str, info: &RuleInfo, meta: &mut RuleMeta) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        let key = rule_key(ruleset, info);
        let id_key = identity_key(ruleset, info);

        let (names, names_updated) = self.names_with(ruleset).await?;
        let ttl = (meta.expires_at - Utc::now())
            .to_std()
            .map_err(|_| StoreError::RuleExpired)?;

        let lease_id = self.client.grant(ttl).await?;

        // Reuse the identity while any rule for this CIDR is alive.
        let existing_identity = match self.client.get(&id_key).await? {
            Some(raw) if raw.value_str() != "0" => Some(raw.value_str()),
            _ => None,
        };

        let txn = match &existing_identity {
            Some(identity) => {
                meta.identity = identity.clone();
                let mut ops = vec![TxnOp::put(
                    key.as_str(),
                    meta.marshal(),
                    Some(PutOptions::new().with_lease(lease_id)),
                )];
                if names_updated {
                    ops.push(TxnOp::put(RULE_NAMES_KEY, marshal_names(&names)?, None));
                }
                Txn::new()
                    .when([Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
                    .and_then(ops)
            }
            None => {
                meta.identity = new_identity();
                Txn::new()
                    .when([
                        Compare::create_revision(key.as_str(), CompareOp::Equal, 0),
                        Compare::create_revision(id_key.as_str(), CompareOp::Equal, 0),
                    ])
                    .and_then([
                        TxnOp::put(
                            key.as_str(),
                            meta.marshal(),
                            Some(PutOptions::new().with_lease(lease_id)),
                        ),
                        TxnOp::put(RULE_NAMES_KEY, marshal_names(&names)?, None),
                        TxnOp::put(
                            id_key.as_str(),
                            meta.identity.clone(),
                            Some(PutOptions::new().with_lease(lease_id)),
                        ),
                    ])
            }
        };

        let resp = match self.client.txn(txn).await {
            Ok(resp) => resp,
            Err(err) => {
                // The lease must not outlive a failed write.
                let _ = self.client.revoke(lease_id).await;
                return Err(err.into());
            }
        };
        if !resp.succeeded() {
            self.client.revoke(lease_id).await?;
            return Err(StoreError::RuleAlreadyExists);
        }
        Ok(())
    }

    /// Update a rule in place. The identity is re-read from its
    /// auxiliary key so it stays stable across updates.
    pub async fn update(&self, ruleset: &str, info: &RuleInfo, meta: &mut RuleMeta) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        let id_key = identity_key(ruleset, info);
        let raw = self
            .client
            .get(&id_key)
            .await?
            .ok_or(StoreError::RuleNotFound)?;
        meta.identity = raw.value_str();

        let key = rule_key(ruleset, info);
        match self.client.update(&key, meta.marshal()).await {
            Ok(()) => Ok(()),
            Err(banfleet_kv::KvError::KeyNotFound) => Err(StoreError::RuleNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a rule; when it was the last rule for its CIDR, the
    /// identity key goes with it.
    pub async fn delete(&self, ruleset: &str, info: &RuleInfo) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;

        let key = rule_key(ruleset, info);
        self.client.delete(&key).await?;

        let id_key = identity_key(ruleset, info);
        let siblings = self.client.get_prefix(&id_key).await?;
        let only_identity_left = siblings.iter().all(|kv| kv.key == id_key);
        if only_identity_left && !siblings.is_empty() {
            debug!(key = %id_key, "last rule for CIDR removed, dropping identity");
            self.client.delete(&id_key).await?;
        }
        Ok(())
    }

    /// All rules of a ruleset, parsed from their key tails. Identity
    /// records (keys ending in `/`) are not rules and are skipped.
    pub async fn get(&self, ruleset: &str) -> StoreResult<Vec<Rule>> {
        let prefix = ruleset_prefix(ruleset);
        let kvs = self.client.get_prefix(&prefix).await?;
        if kvs.is_empty() {
            return Err(StoreError::RuleNotFound);
        }

        let mut rules = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let Some(tail) = kv.key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let Ok(info) = RuleInfo::parse_key_tail(tail) else {
                continue; // identity record or foreign key shape
            };
            let meta = RuleMeta::unmarshal(&kv.value_str())
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            rules.push(Rule { info, meta });
        }

        if rules.is_empty() {
            return Err(StoreError::RuleNotFound);
        }
        Ok(rules)
    }

    /// One page of ruleset names from the names index, each fetched
    /// concurrently (bounded) and aggregated to the first error.
    pub async fn list(&self, page_size: i64, cursor: &str) -> StoreResult<RuleList> {
        let names = self.names().await?;
        if names.is_empty() {
            return Ok(RuleList::default());
        }

        let start = if cursor.is_empty() {
            0
        } else {
            names.iter().position(|n| n == cursor).unwrap_or(0)
        };
        let end = (start + page_size.max(0) as usize).min(names.len());
        let selected = &names[start..end];

        let fetched: Vec<StoreResult<(String, Vec<Rule>)>> = stream::iter(selected.iter().cloned())
            .map(|name| {
                let this = self.clone();
                async move {
                    let rules = this.get(&name).await?;
                    Ok((name, rules))
                }
            })
            .buffered(LIST_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut items = Vec::with_capacity(fetched.len());
        for result in fetched {
            items.push(result?);
        }

        let has_next = end < names.len();
        Ok(RuleList {
            total_count: names.len() as i64,
            has_next,
            next_cursor: if has_next { names[end].clone() } else { String::new() },
            items,
        })
    }

    pub async fn delete_all(&self) -> StoreResult<()> {
        let _guard = self.op_lock.lock().await;
        self.client.delete_prefix(RULE_DIR).await?;
        self.client.delete(RULE_NAMES_KEY).await?;
        Ok(())
    }

    async fn names(&self) -> StoreResult<Vec<String>> {
        match self.client.get(RULE_NAMES_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw.value)
                .map_err(|e| StoreError::Corrupt(format!("rule names index: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Names index plus whether adding `ruleset` changed it.
    async fn names_with(&self, ruleset: &str) -> StoreResult<(Vec<String>, bool)> {
        let mut names = self.names().await?;
        if names.iter().any(|n| n == ruleset) {
            return Ok((names, false));
        }
        names.push(ruleset.to_string());
        Ok((names, true))
    }
}

fn marshal_names(names: &[String]) -> StoreResult<String> {
    serde_json::to_string(names).map_err(|e| StoreError::Corrupt(format!("rule names index: {e}")))
}

/// A fresh 32-bit identity: CRC32 of a random UUID, decimal-encoded.
fn new_identity() -> String {
    let id = uuid::Uuid::new_v4();
    let sum = crc32fast::hash(id.as_bytes());
    format!("{sum}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_identity_is_a_decimal_u32() {
        for _ in 0..32 {
            let identity = new_identity();
            let parsed: u32 = identity.parse().expect("identity must parse as u32");
            assert_eq!(format!("{parsed}"), identity);
        }
    }
}
