//! Write-through cache over single etcd keys.
//!
//! Not a consistency layer: readers may observe stale values. Repeated
//! writes of an unchanged value are absorbed locally and only forced
//! through to etcd every `force_refresh` occurrences, so hot writers
//! (status reporters, cert lookups) stay off the wire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::EtcdClient;
use crate::error::KvResult;
use crate::key::Key;

#[derive(Debug, Clone)]
struct CacheItem {
    value: String,
    revision: i64,
    last_access: Instant,
    /// Consecutive identical updates since the last real put.
    refresh_count: i64,
}

pub struct WriteThroughCache {
    client: EtcdClient,
    force_refresh: i64,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<Key, CacheItem>>>,
    cancel: CancellationToken,
}

impl WriteThroughCache {
    /// `force_refresh`: after this many identical updates, write anyway.
    /// `ttl`/`cleanup_period`: entry lifetime without access, and how
    /// often the eviction loop runs.
    pub fn new(client: EtcdClient, force_refresh: i64, ttl: Duration, cleanup_period: Duration) -> Self {
        let cache: Arc<RwLock<HashMap<Key, CacheItem>>> = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let loop_cache = cache.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cleanup_period);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let now = Instant::now();
                        loop_cache.write().retain(|key, item| {
                            let live = now.duration_since(item.last_access) <= ttl;
                            if !live {
                                debug!(key = %key, "evicting expired cache entry");
                            }
                            live
                        });
                    }
                }
            }
        });

        Self { client, force_refresh, ttl, cache, cancel }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Value and revision for `key`; `force` bypasses the cache.
    /// Returns `None` when the key does not exist.
    pub async fn get(&self, key: &str, force: bool) -> KvResult<Option<(String, i64)>> {
        Ok(self.get_item(key, force).await?.map(|i| (i.value, i.revision)))
    }

    async fn get_item(&self, key: &str, force: bool) -> KvResult<Option<CacheItem>> {
        if !force {
            if let Some(item) = self.cache.write().get_mut(key) {
                item.last_access = Instant::now();
                return Ok(Some(item.clone()));
            }
        }

        let Some(raw) = self.client.get(key).await? else {
            return Ok(None);
        };
        let item = CacheItem {
            value: raw.value_str(),
            revision: raw.mod_revision,
            last_access: Instant::now(),
            refresh_count: 0,
        };
        self.cache.write().insert(key.to_string(), item.clone());
        Ok(Some(item))
    }

    /// Write `new_value` under `key`, skipping the etcd put while the
    /// value is unchanged and the force-refresh budget is not spent.
    pub async fn update(&self, key: &str, new_value: &str) -> KvResult<()> {
        let existing = self.get_item(key, false).await?;

        if let Some(item) = &existing {
            if item.revision != 0 && item.value == new_value && item.refresh_count < self.force_refresh {
                if let Some(cached) = self.cache.write().get_mut(key) {
                    cached.refresh_count += 1;
                    cached.last_access = Instant::now();
                }
                return Ok(());
            }
        }

        let revision = self.client.put(key, new_value, None).await?;
        self.cache.write().insert(
            key.to_string(),
            CacheItem {
                value: new_value.to_string(),
                revision,
                last_access: Instant::now(),
                refresh_count: 0,
            },
        );
        Ok(())
    }

    /// Entry lifetime configured at construction.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
