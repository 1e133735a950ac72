//! Uniform list + watch API over the KV store.
//!
//! `list` serves one page at a fixed revision and hands back a cursor;
//! `watch` tails a prefix from a revision. A reflector composes the two
//! to mirror a prefix without gaps: list, then watch from the revision
//! that served the list.

use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{EventType, GetOptions, Txn, TxnOp, TxnOpResponse, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::EtcdClient;
use crate::error::{KvError, KvResult};
use crate::key::Key;

/// A key-value pair as read from the store, with the metadata the
/// convert hooks may care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawKv {
    pub key: Key,
    pub value: Vec<u8>,
    pub lease_id: i64,
    pub mod_revision: i64,
    pub create_revision: i64,
}

impl RawKv {
    pub(crate) fn from_kv(kv: &etcd_client::KeyValue) -> Self {
        Self {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            lease_id: kv.lease(),
            mod_revision: kv.mod_revision(),
            create_revision: kv.create_revision(),
        }
    }

    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Decodes a raw pair into the caller's value type at the source, so
/// metadata like lease ids survives into the cache.
pub type ItemConvert<T> = Arc<dyn Fn(&RawKv) -> (Key, T) + Send + Sync>;

/// Identity convert: value bytes as a string.
pub fn string_convert() -> ItemConvert<String> {
    Arc::new(|kv: &RawKv| (kv.key.clone(), kv.value_str()))
}

#[derive(Debug, Clone, Default)]
pub struct ListOption {
    pub prefix: Key,
    pub size: i64,
    /// Last key of the previous page; empty on the first call.
    pub cursor: Key,
    /// Revision to read at; 0 means latest.
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOption {
    pub prefix: Key,
    /// Revision to start streaming from; 0 means now.
    pub revision: i64,
}

/// One page of a prefix listing.
#[derive(Debug, Clone)]
pub struct PagedList<T> {
    pub total_count: i64,
    pub total_page: i64,
    pub current_page: i64,
    /// Start key for the next page; empty when this page is the last.
    pub next_cursor: Key,
    /// Revision the page was served at; a watch may resume from it.
    pub revision: i64,
    pub items: Vec<(Key, T)>,
}

impl<T> PagedList<T> {
    pub fn more(&self) -> bool {
        !self.next_cursor.is_empty()
    }

    pub fn empty(revision: i64) -> Self {
        Self {
            total_count: 0,
            total_page: 0,
            current_page: 0,
            next_cursor: Key::new(),
            revision,
            items: Vec::new(),
        }
    }
}

/// A single event from a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Put {
        key: Key,
        value: T,
        lease_id: i64,
        revision: i64,
    },
    Delete {
        key: Key,
        revision: i64,
    },
    Error(String),
}

/// Handle to a running watch. Dropping or [`stop`](Self::stop)ping it
/// cancels the underlying stream; the event channel then closes.
pub struct WatchHandle<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
    cancel: CancellationToken,
}

impl<T> WatchHandle<T> {
    pub(crate) fn from_parts(rx: mpsc::Receiver<WatchEvent<T>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for WatchHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait Lister<T>: Send + Sync {
    async fn list(&self, opt: ListOption) -> KvResult<PagedList<T>>;
}

#[async_trait]
pub trait Watcher<T>: Send + Sync {
    async fn watch(&self, opt: WatchOption) -> KvResult<WatchHandle<T>>;
}

/// Anything that can perform an initial list and then watch from the
/// listed revision.
pub trait ListerWatcher<T>: Lister<T> + Watcher<T> {}
impl<T, U: Lister<T> + Watcher<T>> ListerWatcher<T> for U {}

impl EtcdClient {
    /// List one page under `opt.prefix` with a caller-supplied decode.
    ///
    /// A cursor page reads `size + 1` keys and drops the first: the
    /// cursor key was the last item of the previous page.
    pub async fn list_with<T>(&self, opt: ListOption, convert: ItemConvert<T>) -> KvResult<PagedList<T>> {
        if opt.size <= 0 {
            return Err(KvError::InvalidPageSize);
        }

        let init_list = opt.cursor.is_empty();
        let start_key = if init_list { opt.prefix.clone() } else { opt.cursor.clone() };
        let end_key = Self::prefix_range_end(opt.prefix.as_bytes());

        let mut limit = opt.size;
        if !init_list {
            limit += 1;
        }

        let mut page_opts = GetOptions::new().with_range(end_key).with_limit(limit);
        let mut count_opts = GetOptions::new().with_prefix().with_count_only();
        if opt.revision != 0 {
            page_opts = page_opts.with_revision(opt.revision);
            count_opts = count_opts.with_revision(opt.revision);
        }

        // Both reads go through one transaction so the page and the
        // total count are served at the same revision.
        let txn = Txn::new().and_then([
            TxnOp::get(start_key, Some(page_opts)),
            TxnOp::get(opt.prefix.clone(), Some(count_opts)),
        ]);
        let resp = self.txn(txn).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let mut responses = resp.op_responses().into_iter();
        let page_resp = match responses.next() {
            Some(TxnOpResponse::Get(r)) => r,
            _ => return Err(KvError::Decode("list txn returned no page response".into())),
        };
        let count_resp = match responses.next() {
            Some(TxnOpResponse::Get(r)) => r,
            _ => return Err(KvError::Decode("list txn returned no count response".into())),
        };

        let total_count = count_resp.count();
        if total_count == 0 {
            return Ok(PagedList::empty(revision));
        }

        let mut items: Vec<(Key, T)> = page_resp
            .kvs()
            .iter()
            .map(|kv| convert(&RawKv::from_kv(kv)))
            .collect();
        if !init_list && !items.is_empty() {
            items.remove(0);
        }

        let next_cursor = if page_resp.more() {
            items.last().map(|(k, _)| k.clone()).unwrap_or_default()
        } else {
            Key::new()
        };

        let total_page = ceil_div(total_count, opt.size);
        let current_page = if init_list {
            1
        } else if page_resp.count() == 0 {
            0
        } else {
            ceil_div(total_count - page_resp.count() + 2, opt.size)
        };

        Ok(PagedList {
            total_count,
            total_page,
            current_page,
            next_cursor,
            revision,
            items,
        })
    }

    /// Watch `opt.prefix` from `opt.revision`, decoding values with
    /// `convert`. Events are pumped into a channel until the handle is
    /// stopped or the server cancels the watch.
    pub async fn watch_with<T>(&self, opt: WatchOption, convert: ItemConvert<T>) -> KvResult<WatchHandle<T>>
    where
        T: Send + 'static,
    {
        let mut options = WatchOptions::new().with_prefix();
        if opt.revision != 0 {
            options = options.with_start_revision(opt.revision);
        }

        let mut watch_client = self.raw().watch_client();
        let (mut watcher, mut stream) = watch_client.watch(opt.prefix.as_str(), Some(options)).await?;

        let (tx, rx) = mpsc::channel(128);
        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = pump_cancel.cancelled() => {
                        let _ = watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => message,
                };

                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(WatchEvent::Error(err.to_string())).await;
                        break;
                    }
                };

                if resp.canceled() {
                    let _ = tx
                        .send(WatchEvent::Error(format!(
                            "watch canceled by server: {}",
                            resp.cancel_reason()
                        )))
                        .await;
                    break;
                }

                let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
                for event in resp.events() {
                    let Some(kv) = event.kv() else {
                        warn!("watch event without kv, skipping");
                        continue;
                    };
                    let raw = RawKv::from_kv(kv);
                    let out = match event.event_type() {
                        EventType::Put => {
                            let lease_id = raw.lease_id;
                            let (key, value) = convert(&raw);
                            WatchEvent::Put { key, value, lease_id, revision }
                        }
                        EventType::Delete => WatchEvent::Delete { key: raw.key, revision },
                    };
                    if tx.send(out).await.is_err() {
                        let _ = watcher.cancel().await;
                        return;
                    }
                }
            }
        });

        Ok(WatchHandle { rx, cancel })
    }
}

#[async_trait]
impl Lister<String> for EtcdClient {
    async fn list(&self, opt: ListOption) -> KvResult<PagedList<String>> {
        self.list_with(opt, string_convert()).await
    }
}

#[async_trait]
impl Watcher<String> for EtcdClient {
    async fn watch(&self, opt: WatchOption) -> KvResult<WatchHandle<String>> {
        self.watch_with(opt, string_convert()).await
    }
}

/// Lister/watcher that decodes through a fixed convert function, for
/// caches that need more than the value string (e.g. lease ids).
pub struct ConvertListerWatcher<T> {
    client: EtcdClient,
    convert: ItemConvert<T>,
}

impl<T> ConvertListerWatcher<T> {
    pub fn new(client: EtcdClient, convert: ItemConvert<T>) -> Self {
        Self { client, convert }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Lister<T> for ConvertListerWatcher<T> {
    async fn list(&self, opt: ListOption) -> KvResult<PagedList<T>> {
        self.client.list_with(opt, self.convert.clone()).await
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Watcher<T> for ConvertListerWatcher<T> {
    async fn watch(&self, opt: WatchOption) -> KvResult<WatchHandle<T>> {
        self.client.watch_with(opt, self.convert.clone()).await
    }
}

fn ceil_div(x: i64, y: i64) -> i64 {
    (x + y - 1) / y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(10, 3), 4);
        assert_eq!(ceil_div(9, 3), 3);
        assert_eq!(ceil_div(1, 10), 1);
    }
}
