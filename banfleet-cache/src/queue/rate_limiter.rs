//! Rate limiters deciding how long a retried item should wait.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub trait RateLimiter<K>: Send + Sync {
    /// How long `item` should wait before its next attempt.
    fn when(&self, item: &K) -> Duration;
    /// Stop tracking `item` (it succeeded or was dropped).
    fn forget(&self, item: &K);
    /// How many failures `item` has accumulated.
    fn num_requeues(&self, item: &K) -> usize;
}

/// `base * 2^failures`, capped.
pub struct ItemExponentialFailureRateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K: Eq + Hash + Clone> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { failures: Mutex::new(HashMap::new()), base_delay, max_delay }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock();
        let exp = failures.entry(item.clone()).or_insert(0);
        let shift = (*exp).min(62);
        *exp += 1;

        let backoff = self
            .base_delay
            .checked_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        backoff.min(self.max_delay)
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.failures.lock().get(item).copied().unwrap_or(0) as usize
    }
}

/// Token bucket shared by all items: smooths the overall retry rate.
/// `when` reserves a token, going into debt like a reservation, so
/// callers get back the wait until their reservation is honored.
pub struct BucketRateLimiter {
    state: Mutex<BucketState>,
    qps: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: usize) -> Self {
        Self {
            state: Mutex::new(BucketState { tokens: burst as f64, last: Instant::now() }),
            qps,
            burst: burst as f64,
        }
    }

    fn reserve(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(state.last).as_secs_f64() * self.qps;
        state.tokens = (state.tokens + refill).min(self.burst);
        state.last = now;

        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl<K: Send + Sync> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> usize {
        0
    }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K: Send + Sync> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// The controller default: per-item exponential backoff (1 s doubling,
/// 1000 s cap) maxed with an overall 10 qps / burst 100 token bucket.
pub fn default_controller_rate_limiter<K: Eq + Hash + Clone + Send + Sync + 'static>(
) -> Arc<dyn RateLimiter<K>> {
    Arc::new(MaxOfRateLimiter::new(vec![
        Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(1000),
        )),
        Arc::new(BucketRateLimiter::new(10.0, 100)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_limiter_doubles_and_caps() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(1000),
        );
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(2));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(4));
        for _ in 0..20 {
            limiter.when(&"a");
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1000));

        // Independent per item.
        assert_eq!(limiter.when(&"b"), Duration::from_secs(1));
    }

    #[test]
    fn forget_resets_the_failure_count() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_secs(1),
            Duration::from_secs(1000),
        );
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
    }

    #[test]
    fn bucket_limiter_charges_after_burst() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
        let wait = RateLimiter::<&str>::when(&limiter, &"x");
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(150));
    }

    #[test]
    fn max_of_takes_the_worst_case() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Arc::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_secs(5),
                Duration::from_secs(1000),
            )),
            Arc::new(BucketRateLimiter::new(100.0, 100)),
        ]);
        assert_eq!(limiter.when(&"a"), Duration::from_secs(5));
    }
}
