//! Drains a delta FIFO into a store and dispatches events to handlers
//! registered by key prefix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use banfleet_kv::Key;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::delta_fifo::{Delta, DeltaFifo, DeltaKind};
use crate::store::{Store, ThreadSafeStore};

const SYNCED_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Receives cache events for the prefixes it was registered under.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, key: &str, obj: &T, is_in_initial_list: bool);
    fn on_update(&self, key: &str, old: &T, new: &T);
    /// `obj` is the last known state, absent when the deletion was
    /// detected by a relist.
    fn on_delete(&self, key: &str, obj: Option<&T>);
}

pub type HandlerId = u64;

struct Registered<T> {
    id: HandlerId,
    prefixes: Vec<Key>,
    handler: Arc<dyn EventHandler<T>>,
}

struct Registry<T> {
    next_id: HandlerId,
    handlers: Vec<Registered<T>>,
}

impl<T> Registry<T> {
    fn matching<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Arc<dyn EventHandler<T>>> {
        self.handlers
            .iter()
            .filter(move |r| r.prefixes.iter().any(|p| key.starts_with(p.as_str())))
            .map(|r| &r.handler)
    }
}

/// Read-only view of the informer's cache, handed to controllers and
/// handlers so they never hold the informer itself.
pub struct StoreReader<T> {
    store: Arc<ThreadSafeStore<T>>,
}

impl<T> Clone for StoreReader<T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<T: Clone> StoreReader<T> {
    pub fn get(&self, key: &str) -> Option<T> {
        self.store.get(key)
    }

    pub fn list_map(&self) -> HashMap<Key, T> {
        self.store.list_map()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

pub struct Informer<T> {
    fifo: Arc<DeltaFifo<T>>,
    store: Arc<ThreadSafeStore<T>>,
    /// The event-processing mutex: held while applying deltas and
    /// while snapshot-and-subscribe runs, never across an await.
    registry: Mutex<Registry<T>>,
}

impl<T: Clone + Send + Sync + 'static> Informer<T> {
    pub fn new(fifo: Arc<DeltaFifo<T>>) -> Arc<Self> {
        Arc::new(Self {
            fifo,
            store: Arc::new(ThreadSafeStore::new()),
            registry: Mutex::new(Registry { next_id: 1, handlers: Vec::new() }),
        })
    }

    /// Process deltas until cancelled; closes the FIFO on the way out.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.fifo.close();
                    info!("informer stopped");
                    return;
                }
                popped = self.fifo.pop(|_, deltas, initial| self.process_deltas(deltas, initial)) => {
                    if popped.is_err() {
                        info!("informer stopped");
                        return;
                    }
                }
            }
        }
    }

    fn process_deltas(&self, deltas: &[Delta<T>], is_in_initial_list: bool) -> Result<(), ()> {
        let registry = self.registry.lock();
        for delta in deltas {
            match delta.kind {
                DeltaKind::Sync | DeltaKind::Added | DeltaKind::Updated => {
                    let Some(obj) = &delta.object else { continue };
                    if let Some(old) = self.store.get(&delta.key) {
                        self.store.update(&delta.key, obj.clone());
                        for handler in registry.matching(&delta.key) {
                            handler.on_update(&delta.key, &old, obj);
                        }
                    } else {
                        self.store.add(&delta.key, obj.clone());
                        for handler in registry.matching(&delta.key) {
                            handler.on_add(&delta.key, obj, is_in_initial_list);
                        }
                    }
                }
                DeltaKind::Deleted => {
                    // Watch deletions carry no value; fall back to the
                    // state the store last saw so handlers can act on it.
                    let last_known = delta.object.clone().or_else(|| self.store.get(&delta.key));
                    self.store.delete(&delta.key);
                    for handler in registry.matching(&delta.key) {
                        handler.on_delete(&delta.key, last_known.as_ref());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn register(&self, prefixes: Vec<Key>, handler: Arc<dyn EventHandler<T>>) -> HandlerId {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push(Registered { id, prefixes, handler });
        id
    }

    /// Atomically register `handler` and snapshot the store.
    ///
    /// Holding the processing mutex freezes delta dispatch, so every
    /// event the handler receives afterwards is strictly newer than
    /// the returned snapshot: no gaps, no duplicates.
    pub fn register_handler_and_list(
        &self,
        prefixes: Vec<Key>,
        handler: Arc<dyn EventHandler<T>>,
    ) -> (HandlerId, HashMap<Key, T>) {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push(Registered { id, prefixes, handler });
        let snapshot = self.store.list_map();
        (id, snapshot)
    }

    pub fn unregister(&self, id: HandlerId) {
        self.registry.lock().handlers.retain(|r| r.id != id);
    }

    pub fn has_synced(&self) -> bool {
        self.fifo.has_synced()
    }

    /// Poll `has_synced` every 100 ms until it turns true or the
    /// context is cancelled; returns whether the cache synced.
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.has_synced() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(SYNCED_POLL_PERIOD) => {}
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.store.get(key)
    }

    pub fn list_map(&self) -> HashMap<Key, T> {
        self.store.list_map()
    }

    pub fn reader(&self) -> StoreReader<T> {
        StoreReader { store: self.store.clone() }
    }

    /// The store end the reflector feeds.
    pub fn fifo(&self) -> Arc<DeltaFifo<T>> {
        self.fifo.clone()
    }
}
