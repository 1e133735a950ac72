//! Agent status storage: leased keys behind a reflector-fed cache.
//!
//! Statuses are written through TTL leases; a dead agent stops
//! renewing and its key evaporates. The cache keeps `(value, lease)`
//! pairs so the writer can renew an existing lease and skip writes
//! whose value is unchanged.

use std::sync::Arc;
use std::time::Duration;

use banfleet_cache::{Reflector, Store, ThreadSafeStore};
use banfleet_kv::{ConvertListerWatcher, EtcdClient, ItemConvert, KvError, RawKv};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::node::AgentStatus;
use crate::storage::{status_key, StoreError, StoreResult, AGENT_STATUS_DIR};

pub const STATUS_LEASE_TTL: Duration = Duration::from_secs(30);
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(5);
const SYNC_POLL: Duration = Duration::from_millis(100);

/// What the status cache stores per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseValue {
    pub value: String,
    pub lease_id: i64,
}

fn lease_convert() -> ItemConvert<LeaseValue> {
    Arc::new(|raw: &RawKv| {
        (
            raw.key.clone(),
            LeaseValue { value: raw.value_str(), lease_id: raw.lease_id },
        )
    })
}

#[derive(Clone)]
pub struct StatusStorage {
    client: EtcdClient,
    cache: Arc<ThreadSafeStore<LeaseValue>>,
}

impl StatusStorage {
    /// Starts the backing reflector; it stops with `cancel`.
    pub fn new(client: EtcdClient, cancel: CancellationToken) -> Self {
        let cache = Arc::new(ThreadSafeStore::new());
        let lister_watcher = Arc::new(ConvertListerWatcher::new(client.clone(), lease_convert()));
        let reflector = Reflector::new(
            lister_watcher,
            "status_cache",
            AGENT_STATUS_DIR,
            cache.clone() as Arc<dyn Store<LeaseValue>>,
        );
        tokio::spawn(async move { reflector.run(cancel).await });

        Self { client, cache }
    }

    /// Write `status`, renewing or minting its lease. A byte-identical
    /// value is a no-op.
    pub async fn update(&self, name: &str, status: &AgentStatus) -> StoreResult<()> {
        let key = status_key(name);
        let lease_id = self.renew(&key).await?;

        let new_value = serde_json::to_string(status)
            .map_err(|e| StoreError::Corrupt(format!("marshal agent status: {e}")))?;

        self.wait_for_sync().await;
        if let Some(cached) = self.cache.get(&key) {
            if cached.value == new_value {
                debug!(name = %name, "status unchanged, skipping write");
                return Ok(());
            }
        }

        self.client.put(&key, new_value, Some(lease_id)).await?;
        Ok(())
    }

    /// Read a status. The cache is the primary (possibly stale) path;
    /// `force` or a miss falls through to the store.
    pub async fn get(&self, name: &str, force: bool) -> StoreResult<AgentStatus> {
        let key = status_key(name);

        let raw = if force {
            None
        } else {
            self.wait_for_sync().await;
            self.cache.get(&key).map(|lv| lv.value)
        };

        let raw = match raw {
            Some(value) => value,
            None => match self.client.get_must_exist(&key).await {
                Ok(kv) => kv.value_str(),
                Err(KvError::KeyNotFound) => return Err(StoreError::StatusNotFound),
                Err(err) => return Err(err.into()),
            },
        };

        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("agent status: {e}")))
    }

    /// Reuse the cached lease when it is still alive, otherwise grant
    /// a fresh one.
    async fn renew(&self, key: &str) -> StoreResult<i64> {
        self.wait_for_sync().await;
        if let Some(cached) = self.cache.get(key) {
            if cached.lease_id != 0 && self.client.keep_alive_once(cached.lease_id).await? {
                return Ok(cached.lease_id);
            }
        }
        Ok(self.client.grant(STATUS_LEASE_TTL).await?)
    }

    /// Give the reflector a bounded window to finish its first list;
    /// after the timeout we proceed against whatever is cached.
    async fn wait_for_sync(&self) {
        let deadline = tokio::time::Instant::now() + CACHE_SYNC_TIMEOUT;
        while !self.cache.has_synced() {
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(SYNC_POLL).await;
        }
    }
}
