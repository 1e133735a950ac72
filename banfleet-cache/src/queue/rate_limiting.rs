//! Delaying queue + rate limiter, the shape controllers consume.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use super::delaying::DelayingQueue;
use super::rate_limiter::RateLimiter;

pub struct RateLimitingQueue<K> {
    inner: DelayingQueue<K>,
    limiter: Arc<dyn RateLimiter<K>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> RateLimitingQueue<K> {
    pub fn new(limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self { inner: DelayingQueue::new(), limiter }
    }

    pub fn add(&self, item: K) {
        self.inner.add(item);
    }

    pub fn add_after(&self, item: K, delay: Duration) {
        self.inner.add_after(item, delay);
    }

    /// Re-add `item` after whatever delay the limiter assigns it.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.limiter.when(&item);
        self.inner.add_after(item, delay);
    }

    /// Clear `item`'s failure history, ending its backoff.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> usize {
        self.limiter.num_requeues(item)
    }

    pub async fn get(&self) -> Option<K> {
        self.inner.get().await
    }

    pub fn done(&self, item: K) {
        self.inner.done(item);
    }

    pub fn len(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue().is_empty()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub async fn shutdown_with_drain(&self) {
        self.inner.shutdown_with_drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::rate_limiter::default_controller_rate_limiter;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_exponentially() {
        let queue = RateLimitingQueue::new(default_controller_rate_limiter());

        queue.add_rate_limited("a");
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done("a");

        // Second failure waits ~2 s.
        queue.add_rate_limited("a");
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert!(queue.is_empty());
        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done("a");

        // Forget resets the schedule back to ~1 s.
        queue.forget(&"a");
        queue.add_rate_limited("a");
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done("a");
    }
}
