//! Controller harness: informer events in, rate-limited `sync` calls out.

use std::sync::Arc;

use async_trait::async_trait;
use banfleet_kv::Key;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::informer::{EventHandler, Informer, StoreReader};
use crate::queue::{default_controller_rate_limiter, RateLimitingQueue};

pub type SyncError = Box<dyn std::error::Error + Send + Sync>;

/// The reconciliation a controller performs for one key.
#[async_trait]
pub trait ControllerImpl<T>: Send + Sync {
    /// Key prefixes whose events feed this controller.
    fn listen_prefixes(&self) -> Vec<Key>;

    /// Maps an event key to the queue key (e.g. the agent name).
    fn key_processor(&self, key: &str) -> Key {
        key.to_string()
    }

    async fn sync(&self, key: &str, reader: &StoreReader<T>) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub name: String,
    pub workers: usize,
}

impl ControllerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), workers: 1 }
    }
}

/// Enqueues every informer event for its prefixes and runs worker
/// loops that call `sync` with retry: errors re-queue through the rate
/// limiter, successes forget the key's failure history.
pub struct Controller<T> {
    name: String,
    informer: Arc<Informer<T>>,
    implementation: Arc<dyn ControllerImpl<T>>,
    queue: Arc<RateLimitingQueue<Key>>,
    workers: usize,
}

struct EnqueueHandler<T> {
    implementation: Arc<dyn ControllerImpl<T>>,
    queue: Arc<RateLimitingQueue<Key>>,
}

impl<T> EnqueueHandler<T> {
    fn enqueue(&self, key: &str) {
        let key = self.implementation.key_processor(key);
        if key.is_empty() {
            warn!("event key mapped to empty queue key, dropping");
            return;
        }
        self.queue.add(key);
    }
}

impl<T: Clone + Send + Sync + 'static> EventHandler<T> for EnqueueHandler<T> {
    fn on_add(&self, key: &str, _obj: &T, _is_in_initial_list: bool) {
        self.enqueue(key);
    }

    fn on_update(&self, key: &str, _old: &T, _new: &T) {
        self.enqueue(key);
    }

    fn on_delete(&self, key: &str, _obj: Option<&T>) {
        self.enqueue(key);
    }
}

impl<T: Clone + Send + Sync + 'static> Controller<T> {
    pub fn new(
        informer: Arc<Informer<T>>,
        implementation: Arc<dyn ControllerImpl<T>>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        let queue = Arc::new(RateLimitingQueue::new(default_controller_rate_limiter()));

        informer.register(
            implementation.listen_prefixes(),
            Arc::new(EnqueueHandler {
                implementation: implementation.clone(),
                queue: queue.clone(),
            }),
        );

        Arc::new(Self {
            name: options.name,
            informer,
            implementation,
            queue,
            workers: options.workers.max(1),
        })
    }

    /// Wait for the cache, then run worker loops until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(controller = %self.name, "waiting for informer caches to sync");
        if !self.informer.wait_for_cache_sync(&cancel).await {
            info!(controller = %self.name, "cancelled before caches synced");
            return;
        }
        info!(controller = %self.name, "caches synced, starting workers");

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let this = self.clone();
            handles.push(tokio::spawn(async move { this.worker().await }));
        }

        cancel.cancelled().await;
        self.queue.shutdown();
        for handle in handles {
            let _ = handle.await;
        }
        info!(controller = %self.name, "controller stopped");
    }

    async fn worker(&self) {
        let reader = self.informer.reader();
        while let Some(key) = self.queue.get().await {
            match self.implementation.sync(&key, &reader).await {
                Ok(()) => {
                    self.queue.forget(&key);
                    debug!(controller = %self.name, key = %key, "synced");
                }
                Err(err) => {
                    warn!(
                        controller = %self.name,
                        key = %key,
                        retries = self.queue.num_requeues(&key),
                        error = %err,
                        "sync failed, requeuing"
                    );
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(key);
        }
    }
}
