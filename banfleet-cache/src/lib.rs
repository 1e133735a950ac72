//! The list-watch cache behind the banfleet reconciliation engine.
//!
//! A [`Reflector`] mirrors a KV prefix into a [`DeltaFifo`]; an
//! [`Informer`] drains the FIFO into a [`ThreadSafeStore`] and
//! dispatches events to prefix-registered handlers; controllers push
//! event keys through a [`RateLimitingQueue`] and reconcile them in
//! worker loops. The layering follows the canonical client-go cache
//! pattern, reshaped for generic value types.

pub mod controller;
pub mod delta_fifo;
pub mod informer;
pub mod queue;
pub mod reflector;
pub mod store;

pub use controller::{Controller, ControllerImpl, ControllerOptions, SyncError};
pub use delta_fifo::{Delta, DeltaFifo, DeltaKind, FifoClosed};
pub use informer::{EventHandler, HandlerId, Informer, StoreReader};
pub use queue::{
    default_controller_rate_limiter, DelayingQueue, RateLimiter, RateLimitingQueue, WorkQueue,
};
pub use reflector::Reflector;
pub use store::{Store, ThreadSafeStore};
