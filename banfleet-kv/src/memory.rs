//! In-process KV implementing the lister/watcher contract.
//!
//! Backs the cache and controller test suites so they exercise the real
//! reflector/informer stack against a real collaborator instead of a
//! mocked stream. Keeps an event log so a watch can resume from any
//! revision the way etcd does.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{KvError, KvResult};
use crate::key::Key;
use crate::list_watch::{ListOption, Lister, PagedList, WatchEvent, WatchHandle, WatchOption, Watcher};

#[derive(Default)]
struct State {
    map: BTreeMap<Key, String>,
    revision: i64,
    log: Vec<WatchEvent<String>>,
    watchers: Vec<WatcherEntry>,
}

struct WatcherEntry {
    prefix: Key,
    tx: mpsc::Sender<WatchEvent<String>>,
    cancel: CancellationToken,
}

/// Shared, cloneable in-memory store.
#[derive(Clone, Default)]
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<Key>, value: impl Into<String>) -> i64 {
        let key = key.into();
        let value = value.into();
        let mut state = self.state.lock();
        state.revision += 1;
        let revision = state.revision;
        state.map.insert(key.clone(), value.clone());
        let event = WatchEvent::Put { key, value, lease_id: 0, revision };
        state.log.push(event.clone());
        Self::dispatch(&mut state, event);
        revision
    }

    pub fn delete(&self, key: &str) -> i64 {
        let mut state = self.state.lock();
        if state.map.remove(key).is_none() {
            return state.revision;
        }
        state.revision += 1;
        let revision = state.revision;
        let event = WatchEvent::Delete { key: key.to_string(), revision };
        state.log.push(event.clone());
        Self::dispatch(&mut state, event);
        revision
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().map.get(key).cloned()
    }

    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Drop every registered watcher, closing their channels.
    pub fn close_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    fn dispatch(state: &mut State, event: WatchEvent<String>) {
        state.watchers.retain(|w| {
            if w.cancel.is_cancelled() {
                return false;
            }
            let key = match &event {
                WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
                WatchEvent::Error(_) => return true,
            };
            if !key.starts_with(w.prefix.as_str()) {
                return true;
            }
            w.tx.try_send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl Lister<String> for MemoryKv {
    async fn list(&self, opt: ListOption) -> KvResult<PagedList<String>> {
        if opt.size <= 0 {
            return Err(KvError::InvalidPageSize);
        }
        let state = self.state.lock();
        let init_list = opt.cursor.is_empty();
        let start = if init_list { opt.prefix.clone() } else { opt.cursor.clone() };

        let all: Vec<(Key, String)> = state
            .map
            .range(start.clone()..)
            .filter(|(k, _)| k.starts_with(opt.prefix.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let total_count = state
            .map
            .keys()
            .filter(|k| k.starts_with(opt.prefix.as_str()))
            .count() as i64;

        let mut limit = opt.size as usize;
        if !init_list {
            limit += 1;
        }
        let mut items: Vec<(Key, String)> = all.iter().take(limit).cloned().collect();
        if !init_list && !items.is_empty() {
            items.remove(0);
        }

        let more = all.len() > limit;
        let next_cursor = if more {
            items.last().map(|(k, _)| k.clone()).unwrap_or_default()
        } else {
            Key::new()
        };

        Ok(PagedList {
            total_count,
            total_page: (total_count + opt.size - 1) / opt.size,
            current_page: 1,
            next_cursor,
            revision: state.revision,
            items,
        })
    }
}

#[async_trait]
impl Watcher<String> for MemoryKv {
    async fn watch(&self, opt: WatchOption) -> KvResult<WatchHandle<String>> {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        let mut state = self.state.lock();
        if opt.revision != 0 {
            // Replay history from the requested revision, like etcd.
            for event in &state.log {
                let (key, revision) = match event {
                    WatchEvent::Put { key, revision, .. } => (key, *revision),
                    WatchEvent::Delete { key, revision } => (key, *revision),
                    WatchEvent::Error(_) => continue,
                };
                if revision >= opt.revision && key.starts_with(opt.prefix.as_str()) {
                    let _ = tx.try_send(event.clone());
                }
            }
        }
        state.watchers.push(WatcherEntry {
            prefix: opt.prefix,
            tx,
            cancel: cancel.clone(),
        });

        Ok(WatchHandle::from_parts(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_pages_with_cursor_skip() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.put(format!("/t/{i}"), format!("v{i}"));
        }

        let first = kv
            .list(ListOption { prefix: "/t/".into(), size: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.more());

        let second = kv
            .list(ListOption {
                prefix: "/t/".into(),
                size: 2,
                cursor: first.next_cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.items[0].0, "/t/2");
    }

    #[tokio::test]
    async fn watch_replays_from_revision() {
        let kv = MemoryKv::new();
        let rev = kv.put("/t/a", "1");
        kv.put("/t/b", "2");

        let mut handle = kv
            .watch(WatchOption { prefix: "/t/".into(), revision: rev + 1 })
            .await
            .unwrap();
        match handle.recv().await.unwrap() {
            WatchEvent::Put { key, .. } => assert_eq!(key, "/t/b"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
