//! FIFO of unique items with dirty/processing accounting.
//!
//! The contract controllers rely on: an item is processed by at most
//! one worker at a time, and re-adds during processing collapse into
//! exactly one future delivery.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Items awaiting processing (queued or re-added mid-flight).
    dirty: HashSet<K>,
    /// Items a worker currently holds.
    processing: HashSet<K>,
    shutting_down: bool,
    drain: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
                drain: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark `item` as needing processing. No-op when already dirty;
    /// deferred (not queued) when a worker currently holds it.
    pub fn add(&self, item: K) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Next item to process, or `None` when the queue shut down.
    /// The caller must pair every `Some` with a [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`; re-queue it if it went dirty while
    /// being processed.
    pub fn done(&self, item: K) {
        let mut state = self.state.lock();
        state.processing.remove(&item);
        if state.dirty.contains(&item) {
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_waiters();
        } else if state.processing.is_empty() {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.drain = false;
        state.shutting_down = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Shut down, waiting for workers to `done` everything in flight.
    pub async fn shutdown_with_drain(&self) {
        {
            let mut state = self.state.lock();
            state.drain = true;
            state.shutting_down = true;
        }
        self.notify.notify_waiters();

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.processing.is_empty() || !state.drain {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn add_while_processing_defers_requeue() {
        let queue = WorkQueue::new();
        queue.add("a");

        let item = queue.get().await.unwrap();
        assert_eq!(item, "a");

        // Re-added mid-flight: not queued yet.
        queue.add("a");
        assert_eq!(queue.len(), 0);

        queue.done("a");
        assert_eq!(queue.len(), 1);

        // Exactly one future delivery.
        let again = queue.get().await.unwrap();
        assert_eq!(again, "a");
        queue.done("a");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn get_returns_none_after_shutdown() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn a_key_is_held_by_at_most_one_worker() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        queue.add("a");

        let first = queue.get().await.unwrap();
        queue.add("a");

        // A second worker must not receive "a" while the first still
        // holds it.
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        queue.done(first);
        assert_eq!(second.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_with_drain_waits_for_done() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        queue.add("a");
        let item = queue.get().await.unwrap();

        let drainer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shutdown_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drainer.is_finished());

        queue.done(item);
        drainer.await.unwrap();
    }
}
