//! Concurrent key-to-value snapshot store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use banfleet_kv::Key;
use parking_lot::RwLock;

/// Sink for a reflector: something that can absorb watch deltas and a
/// full replacement list. Implemented by both [`ThreadSafeStore`]
/// (plain mirror) and [`crate::DeltaFifo`] (queued deltas).
pub trait Store<T>: Send + Sync {
    fn add(&self, key: &str, obj: T);
    fn update(&self, key: &str, obj: T);
    fn delete(&self, key: &str);
    /// Atomically swap in the result of a full list at `revision`.
    fn replace(&self, items: Vec<(Key, T)>, revision: i64);
    /// One reflector finished its initial list.
    fn sync_done(&self);
    fn has_synced(&self) -> bool;
}

/// RwLock-guarded map with a one-way synced flag.
pub struct ThreadSafeStore<T> {
    items: RwLock<HashMap<Key, T>>,
    synced: AtomicBool,
}

impl<T> Default for ThreadSafeStore<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> ThreadSafeStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.items.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.items.read().values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<Key> {
        self.items.read().keys().cloned().collect()
    }

    /// Snapshot of the whole map.
    pub fn list_map(&self) -> HashMap<Key, T> {
        self.items.read().clone()
    }

    /// Iterate a snapshot; `f` returning false stops early.
    pub fn range(&self, mut f: impl FnMut(&Key, &T) -> bool) {
        for (k, v) in self.items.read().iter() {
            if !f(k, v) {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl<T: Clone + Send + Sync> Store<T> for ThreadSafeStore<T> {
    fn add(&self, key: &str, obj: T) {
        self.items.write().insert(key.to_string(), obj);
    }

    fn update(&self, key: &str, obj: T) {
        self.items.write().insert(key.to_string(), obj);
    }

    fn delete(&self, key: &str) {
        self.items.write().remove(key);
    }

    fn replace(&self, items: Vec<(Key, T)>, _revision: i64) {
        let mut map = HashMap::with_capacity(items.len());
        for (k, v) in items {
            map.insert(k, v);
        }
        *self.items.write() = map;
    }

    fn sync_done(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_the_whole_map() {
        let store = ThreadSafeStore::new();
        store.add("/a", 1);
        store.add("/b", 2);

        store.replace(vec![("/c".to_string(), 3)], 7);

        assert_eq!(store.get("/a"), None);
        assert_eq!(store.get("/c"), Some(3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sync_done_is_one_way() {
        let store: ThreadSafeStore<i32> = ThreadSafeStore::new();
        assert!(!store.has_synced());
        store.sync_done();
        assert!(store.has_synced());
    }

    #[test]
    fn range_stops_when_asked() {
        let store = ThreadSafeStore::new();
        for i in 0..10 {
            store.add(&format!("/k{i}"), i);
        }
        let mut seen = 0;
        store.range(|_, _| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);
    }
}
