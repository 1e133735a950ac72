//! Per-key delta queue with deletion dedup and sync accounting.
//!
//! The accumulator for a key is not the object itself but the ordered
//! list of deltas observed for it since it was last popped. A consumer
//! therefore sees everything that happened to a key in one delivery,
//! and a key is queued at most once at a time.

use std::collections::{HashMap, VecDeque};

use banfleet_kv::Key;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("delta fifo is closed")]
pub struct FifoClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Synthetic delta emitted for every key of a full relist.
    Sync,
}

/// One observed change. For `Deleted`, `object` is the last known
/// state; `final_state_unknown` marks deletions detected by a relist,
/// where the true final state was never observed.
#[derive(Debug, Clone)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub key: Key,
    pub object: Option<T>,
    pub final_state_unknown: bool,
}

struct FifoState<T> {
    items: HashMap<Key, Vec<Delta<T>>>,
    queue: VecDeque<Key>,
    populated: bool,
    initial_population_count: usize,
    /// Number of reflectors still owing their first list.
    wait_init_num: usize,
    closed: bool,
}

pub struct DeltaFifo<T> {
    state: Mutex<FifoState<T>>,
    notify: Notify,
}

impl<T: Clone> DeltaFifo<T> {
    pub fn new() -> Self {
        Self::with_wait(0)
    }

    /// `wait_init_num`: how many reflectors feed this FIFO; the queue
    /// does not report synced until each has completed a list.
    pub fn with_wait(wait_init_num: usize) -> Self {
        Self {
            state: Mutex::new(FifoState {
                items: HashMap::new(),
                queue: VecDeque::new(),
                populated: false,
                initial_population_count: 0,
                wait_init_num,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn has_synced(&self) -> bool {
        let state = self.state.lock();
        Self::has_synced_locked(&state)
    }

    fn has_synced_locked(state: &FifoState<T>) -> bool {
        state.populated && state.wait_init_num == 0 && state.initial_population_count == 0
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    fn queue_action_locked(state: &mut FifoState<T>, delta: Delta<T>) {
        let key = delta.key.clone();
        let deltas = state.items.entry(key.clone()).or_default();
        let was_empty = deltas.is_empty();
        deltas.push(delta);
        dedup_deltas(deltas);
        if was_empty {
            state.queue.push_back(key);
        }
    }

    fn enqueue(&self, delta: Delta<T>) {
        let mut state = self.state.lock();
        state.populated = true;
        Self::queue_action_locked(&mut state, delta);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn push_added(&self, key: &str, obj: T) {
        self.enqueue(Delta {
            kind: DeltaKind::Added,
            key: key.to_string(),
            object: Some(obj),
            final_state_unknown: false,
        });
    }

    pub fn push_updated(&self, key: &str, obj: T) {
        self.enqueue(Delta {
            kind: DeltaKind::Updated,
            key: key.to_string(),
            object: Some(obj),
            final_state_unknown: false,
        });
    }

    pub fn push_deleted(&self, key: &str) {
        self.enqueue(Delta {
            kind: DeltaKind::Deleted,
            key: key.to_string(),
            object: None,
            final_state_unknown: false,
        });
    }

    /// Re-insert a popped delta list, unless the key has accumulated
    /// new deltas in the meantime. Used to retry after a processing
    /// failure without racing the producer.
    pub fn add_if_not_present(&self, key: &str, deltas: Vec<Delta<T>>) {
        let mut state = self.state.lock();
        state.populated = true;
        if state.items.contains_key(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        state.items.insert(key.to_string(), deltas);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Deliver the full delta list for the next key to `process`.
    ///
    /// `process` runs under the queue lock, so anything it keeps in
    /// sync with the queue stays consistent; it must not block. On
    /// processing error the delta list is re-inserted at the tail.
    pub async fn pop<E>(
        &self,
        mut process: impl FnMut(&str, &[Delta<T>], bool) -> Result<(), E>,
    ) -> Result<Key, FifoClosed> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    let is_in_initial_list = !Self::has_synced_locked(&state);
                    if state.initial_population_count > 0 {
                        state.initial_population_count -= 1;
                    }
                    let Some(deltas) = state.items.remove(&key) else {
                        error!(key = %key, "key was queued but has no deltas");
                        continue;
                    };
                    if process(&key, &deltas, is_in_initial_list).is_err() {
                        // Retry semantics: put the unprocessed deltas back.
                        if !state.items.contains_key(&key) {
                            state.queue.push_back(key.clone());
                            state.items.insert(key.clone(), deltas);
                        }
                    }
                    return Ok(key);
                }
                if state.closed {
                    return Err(FifoClosed);
                }
            }

            notified.await;
        }
    }

    /// Called by the reflector after a full list: a `Sync` delta per
    /// listed key, plus a final-state-unknown `Deleted` for every
    /// queued key the list no longer contains.
    pub fn replace_items(&self, items: Vec<(Key, T)>, _revision: i64) {
        let mut state = self.state.lock();

        let mut listed: HashMap<&str, ()> = HashMap::with_capacity(items.len());
        for (key, _) in &items {
            listed.insert(key.as_str(), ());
        }

        let mut queued_deletions = 0;
        let stale: Vec<(Key, Option<T>)> = state
            .items
            .iter()
            .filter(|(key, _)| !listed.contains_key(key.as_str()))
            .map(|(key, deltas)| (key.clone(), deltas.last().and_then(|d| d.object.clone())))
            .collect();
        for (key, last_known) in stale {
            queued_deletions += 1;
            Self::queue_action_locked(
                &mut state,
                Delta {
                    kind: DeltaKind::Deleted,
                    key,
                    object: last_known,
                    final_state_unknown: true,
                },
            );
        }

        let listed_count = items.len();
        for (key, obj) in items {
            Self::queue_action_locked(
                &mut state,
                Delta {
                    kind: DeltaKind::Sync,
                    key,
                    object: Some(obj),
                    final_state_unknown: false,
                },
            );
        }

        if !state.populated {
            state.populated = true;
            state.initial_population_count = listed_count + queued_deletions;
        }

        drop(state);
        self.notify.notify_waiters();
    }

    pub fn sync_done_once(&self) {
        let mut state = self.state.lock();
        if state.wait_init_num > 0 {
            state.wait_init_num -= 1;
        }
    }
}

impl<T: Clone> Default for DeltaFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> crate::store::Store<T> for DeltaFifo<T> {
    fn add(&self, key: &str, obj: T) {
        self.push_added(key, obj);
    }

    fn update(&self, key: &str, obj: T) {
        self.push_updated(key, obj);
    }

    fn delete(&self, key: &str) {
        self.push_deleted(key);
    }

    fn replace(&self, items: Vec<(Key, T)>, revision: i64) {
        self.replace_items(items, revision);
    }

    fn sync_done(&self) {
        self.sync_done_once();
    }

    fn has_synced(&self) -> bool {
        DeltaFifo::has_synced(self)
    }
}

/// Collapse the newest two deltas when both are deletions, keeping the
/// one that carries the richer state (an observed deletion beats a
/// relist-detected one).
fn dedup_deltas<T>(deltas: &mut Vec<Delta<T>>) {
    let n = deltas.len();
    if n < 2 {
        return;
    }
    let newest = &deltas[n - 1];
    let previous = &deltas[n - 2];
    if newest.kind != DeltaKind::Deleted || previous.kind != DeltaKind::Deleted {
        return;
    }
    if previous.final_state_unknown {
        deltas.swap_remove(n - 2);
    } else {
        deltas.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_kinds<T>(deltas: &[Delta<T>]) -> Vec<DeltaKind> {
        deltas.iter().map(|d| d.kind).collect()
    }

    #[tokio::test]
    async fn pop_delivers_full_delta_list_per_key() {
        let fifo = DeltaFifo::new();
        fifo.push_added("/a", 1);
        fifo.push_updated("/a", 2);
        fifo.push_added("/b", 3);

        let mut seen = Vec::new();
        let key = fifo
            .pop(|key, deltas, _| {
                seen = collect_kinds(deltas);
                Ok::<(), ()>(())
            })
            .await
            .unwrap();
        assert_eq!(key, "/a");
        assert_eq!(seen, vec![DeltaKind::Added, DeltaKind::Updated]);
    }

    #[tokio::test]
    async fn deletion_dedup_prefers_known_state() {
        let fifo: DeltaFifo<i32> = DeltaFifo::new();
        fifo.push_added("/a", 1);
        // A relist-detected deletion followed by an observed one.
        fifo.replace_items(vec![], 1);
        fifo.push_deleted("/a");

        let mut kinds = Vec::new();
        let mut unknown = Vec::new();
        fifo.pop(|_, deltas, _| {
            kinds = collect_kinds(deltas);
            unknown = deltas.iter().map(|d| d.final_state_unknown).collect();
            Ok::<(), ()>(())
        })
        .await
        .unwrap();

        assert_eq!(kinds, vec![DeltaKind::Added, DeltaKind::Deleted]);
        // The observed deletion replaced the final-state-unknown one.
        assert_eq!(unknown, vec![false, false]);
    }

    #[tokio::test]
    async fn replace_emits_sync_and_sentinel_deletions() {
        let fifo = DeltaFifo::new();
        fifo.push_added("/gone", 1);
        fifo.replace_items(vec![("/kept".to_string(), 2)], 5);

        let mut popped = Vec::new();
        for _ in 0..2 {
            fifo.pop(|key, deltas, _| {
                popped.push((key.to_string(), collect_kinds(deltas)));
                Ok::<(), ()>(())
            })
            .await
            .unwrap();
        }

        assert!(popped.iter().any(|(k, kinds)| k == "/gone" && kinds.contains(&DeltaKind::Deleted)));
        assert!(popped.iter().any(|(k, kinds)| k == "/kept" && kinds == &vec![DeltaKind::Sync]));
    }

    #[tokio::test]
    async fn has_synced_requires_first_replace_fully_popped() {
        let fifo = DeltaFifo::with_wait(1);
        fifo.replace_items(vec![("/a".to_string(), 1)], 1);
        assert!(!fifo.has_synced());

        fifo.sync_done_once();
        assert!(!fifo.has_synced());

        fifo.pop(|_, _, initial| {
            assert!(initial);
            Ok::<(), ()>(())
        })
        .await
        .unwrap();
        assert!(fifo.has_synced());
    }

    #[tokio::test]
    async fn empty_replace_still_counts_as_populated() {
        let fifo: DeltaFifo<i32> = DeltaFifo::new();
        fifo.replace_items(vec![], 1);
        assert!(fifo.has_synced());
    }

    #[tokio::test]
    async fn pop_after_close_returns_sentinel() {
        let fifo: DeltaFifo<i32> = DeltaFifo::new();
        fifo.close();
        let err = fifo.pop(|_, _, _| Ok::<(), ()>(())).await.unwrap_err();
        assert_eq!(err, FifoClosed);
    }

    #[tokio::test]
    async fn failed_processing_requeues_the_deltas() {
        let fifo = DeltaFifo::new();
        fifo.push_added("/a", 1);

        fifo.pop(|_, _, _| Err::<(), ()>(())).await.unwrap();
        assert_eq!(fifo.len(), 1);

        let mut kinds = Vec::new();
        fifo.pop(|_, deltas, _| {
            kinds = collect_kinds(deltas);
            Ok::<(), ()>(())
        })
        .await
        .unwrap();
        assert_eq!(kinds, vec![DeltaKind::Added]);
    }
}
