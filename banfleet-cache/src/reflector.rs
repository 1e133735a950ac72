//! Mirrors a KV prefix into a store: full list, then watch from the
//! listed revision, with backoff-and-relist on any watch failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use banfleet_kv::{Key, KvError, KvResult, ListOption, ListPager, ListerWatcher, WatchEvent, WatchOption};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::Store;

const BACKOFF_INITIAL: Duration = Duration::from_millis(800);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// After this long without failures the backoff resets.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(120);
/// A watch that closes faster than this with zero events is an error.
const MIN_WATCH_DURATION: Duration = Duration::from_secs(1);

struct Backoff {
    delay: Duration,
    last_failure: Option<Instant>,
}

impl Backoff {
    fn new() -> Self {
        Self { delay: BACKOFF_INITIAL, last_failure: None }
    }

    fn next(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) > BACKOFF_RESET_AFTER {
                self.delay = BACKOFF_INITIAL;
            }
        }
        self.last_failure = Some(now);
        let current = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_CAP);
        current
    }
}

/// Watches a prefix and reflects every change into a [`Store`].
pub struct Reflector<T> {
    name: String,
    prefix: Key,
    store: Arc<dyn Store<T>>,
    lister_watcher: Arc<dyn ListerWatcher<T>>,
    page_size: i64,
    last_sync_revision: Mutex<i64>,
}

impl<T: Clone + Send + Sync + 'static> Reflector<T> {
    pub fn new(
        lister_watcher: Arc<dyn ListerWatcher<T>>,
        name: impl Into<String>,
        prefix: impl Into<Key>,
        store: Arc<dyn Store<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            store,
            lister_watcher,
            page_size: 0,
            last_sync_revision: Mutex::new(0),
        }
    }

    pub fn last_sync_revision(&self) -> i64 {
        *self.last_sync_revision.lock()
    }

    /// List-and-watch until cancelled, backing off between failures.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(name = %self.name, prefix = %self.prefix, "starting reflector");
        let mut backoff = Backoff::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.list_and_watch(&cancel).await {
                Ok(()) => break, // cancelled
                Err(err) => {
                    warn!(name = %self.name, prefix = %self.prefix, error = %err, "list-and-watch failed");
                }
            }
            let delay = backoff.next();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(name = %self.name, "reflector stopped");
    }

    /// One full cycle: paged list at the last known revision, replace
    /// the store, then watch from the revision that served the list.
    /// The watch is only started after the list completes.
    async fn list_and_watch(&self, cancel: &CancellationToken) -> KvResult<()> {
        let revision = self.list(cancel).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }
        debug!(name = %self.name, revision, "caches populated");
        self.watch(cancel, revision).await
    }

    async fn list(&self, cancel: &CancellationToken) -> KvResult<i64> {
        let options = ListOption {
            prefix: self.prefix.clone(),
            size: self.page_size,
            cursor: Key::new(),
            revision: *self.last_sync_revision.lock(),
        };

        let pager = ListPager::default();
        let list = tokio::select! {
            _ = cancel.cancelled() => return Ok(0),
            list = pager.list(self.lister_watcher.as_ref(), options) => list?,
        };

        let revision = list.revision;
        self.store.replace(list.items, revision);
        self.store.sync_done();
        *self.last_sync_revision.lock() = revision;
        Ok(revision)
    }

    async fn watch(&self, cancel: &CancellationToken, list_revision: i64) -> KvResult<()> {
        let mut handle = self
            .lister_watcher
            .watch(WatchOption {
                prefix: self.prefix.clone(),
                // The list already covers everything at its revision.
                revision: list_revision + 1,
            })
            .await?;

        let started = Instant::now();
        let mut event_count: u64 = 0;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    handle.stop();
                    return Ok(());
                }
                event = handle.recv() => event,
            };

            match event {
                Some(WatchEvent::Put { key, value, revision, .. }) => {
                    self.store.update(&key, value);
                    *self.last_sync_revision.lock() = revision;
                    event_count += 1;
                }
                Some(WatchEvent::Delete { key, revision }) => {
                    self.store.delete(&key);
                    *self.last_sync_revision.lock() = revision;
                    event_count += 1;
                }
                Some(WatchEvent::Error(message)) => {
                    handle.stop();
                    return Err(KvError::WatchClosed(message));
                }
                None => {
                    let elapsed = started.elapsed();
                    if elapsed < MIN_WATCH_DURATION && event_count == 0 {
                        return Err(KvError::WatchClosed(
                            "very short watch: closed in under a second with no events".into(),
                        ));
                    }
                    info!(name = %self.name, events = event_count, "watch closed");
                    return Err(KvError::WatchClosed("watch stream ended".into()));
                }
            }
        }
    }
}
