//! Etcd access layer for banfleet.
//!
//! Wraps `etcd-client` with the primitives the rest of the system is
//! built on: `/`-separated key algebra, a paged lister + prefix watcher
//! with resumable revisions, a list pager, lease helpers, a
//! write-through cache, and leased leader election.

pub mod cache;
pub mod client;
pub mod election;
pub mod error;
pub mod key;
pub mod list_watch;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod pager;

pub use client::{EtcdClient, EtcdConfig};
// Transaction building blocks, re-exported so storage layers can
// compose conditional writes without naming etcd-client directly.
pub use etcd_client::{Compare, CompareOp, PutOptions, Txn, TxnOp, TxnOpResponse};
pub use error::{KvError, KvResult};
pub use key::Key;
pub use list_watch::{
    ConvertListerWatcher, ItemConvert, ListOption, Lister, ListerWatcher, PagedList, RawKv,
    WatchEvent, WatchHandle, WatchOption, Watcher,
};
pub use pager::ListPager;
