//! Work queue stack: unique-item FIFO, delayed re-add, rate limiting.

mod delaying;
mod rate_limiter;
mod rate_limiting;
mod workqueue;

pub use delaying::DelayingQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting::RateLimitingQueue;
pub use workqueue::WorkQueue;
