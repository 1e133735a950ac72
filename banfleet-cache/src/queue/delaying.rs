//! Adds a "ready at" dimension to the work queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::workqueue::WorkQueue;

/// The timer loop wakes at least this often even with nothing queued,
/// so a missed wakeup cannot stall scheduled items for long.
const MAX_WAIT: Duration = Duration::from_secs(10);

struct WaitFor<K> {
    ready_at: Instant,
    seq: u64,
    item: K,
}

/// Work queue with [`add_after`](Self::add_after): items surface on the
/// inner queue once their delay elapses. One background task services
/// a min-heap of pending items.
pub struct DelayingQueue<K> {
    queue: Arc<WorkQueue<K>>,
    waiting_tx: mpsc::UnboundedSender<WaitFor<K>>,
    cancel: CancellationToken,
}

impl<K: Eq + Hash + Clone + Send + 'static> DelayingQueue<K> {
    pub fn new() -> Self {
        Self::with_queue(Arc::new(WorkQueue::new()))
    }

    pub fn with_queue(queue: Arc<WorkQueue<K>>) -> Self {
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(waiting_loop(queue.clone(), waiting_rx, cancel.clone()));
        Self { queue, waiting_tx, cancel }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<K>> {
        &self.queue
    }

    pub fn add(&self, item: K) {
        self.queue.add(item);
    }

    /// Add `item` once `delay` has passed; a zero delay adds directly.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.queue.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }
        let _ = self.waiting_tx.send(WaitFor {
            ready_at: Instant::now() + delay,
            seq: 0,
            item,
        });
    }

    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    pub fn done(&self, item: K) {
        self.queue.done(item);
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.shutdown();
    }

    pub async fn shutdown_with_drain(&self) {
        self.cancel.cancel();
        self.queue.shutdown_with_drain().await;
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Default for DelayingQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> PartialEq for WaitFor<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl<K> Eq for WaitFor<K> {}
impl<K> PartialOrd for WaitFor<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for WaitFor<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ready_at.cmp(&other.ready_at).then(self.seq.cmp(&other.seq))
    }
}

async fn waiting_loop<K: Eq + Hash + Clone + Send + 'static>(
    queue: Arc<WorkQueue<K>>,
    mut waiting_rx: mpsc::UnboundedReceiver<WaitFor<K>>,
    cancel: CancellationToken,
) {
    let mut heap: BinaryHeap<Reverse<WaitFor<K>>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        // Flush everything that is ready.
        let now = Instant::now();
        while heap.peek().is_some_and(|Reverse(head)| head.ready_at <= now) {
            if let Some(Reverse(entry)) = heap.pop() {
                queue.add(entry.item);
            }
        }

        let next_wakeup = heap
            .peek()
            .map(|Reverse(head)| head.ready_at)
            .unwrap_or_else(|| now + MAX_WAIT)
            .min(now + MAX_WAIT);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next_wakeup) => {}
            incoming = waiting_rx.recv() => {
                match incoming {
                    Some(mut entry) => {
                        seq += 1;
                        entry.seq = seq;
                        if entry.ready_at <= Instant::now() {
                            queue.add(entry.item);
                        } else {
                            heap.push(Reverse(entry));
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn add_after_surfaces_once_delay_elapses() {
        let queue = DelayingQueue::new();
        queue.add_after("late", Duration::from_millis(500));
        tokio::task::yield_now().await;
        assert_eq!(queue.queue().len(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        let item = queue.get().await.unwrap();
        assert_eq!(item, "late");
        queue.done(item);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_adds_immediately() {
        let queue = DelayingQueue::new();
        queue.add_after("now", Duration::ZERO);
        assert_eq!(queue.get().await, Some("now"));
    }
}
