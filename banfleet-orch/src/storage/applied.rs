//! Applied strategies: the running bucket feeds the strategy
//! controller, the history bucket is the terminal archive. The two
//! never share a name.

use banfleet_kv::{EtcdClient, Key, KvError, ListOption, Lister};

use crate::model::list::ListMeta;
use crate::model::strategy::{Applied, AppliedList};
use crate::storage::{
    history_key, running_key, StoreError, StoreResult, APPLIED_HISTORY_DIR, APPLIED_RUNNING_DIR,
};

#[derive(Clone)]
pub struct AppliedStorage {
    client: EtcdClient,
}

impl AppliedStorage {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }

    pub async fn add_running(&self, applied: &Applied) -> StoreResult<()> {
        self.create(&running_key(&applied.name), applied).await
    }

    pub async fn update_running(&self, applied: &Applied) -> StoreResult<()> {
        self.update(&running_key(&applied.name), applied).await
    }

    /// Deleting an absent running applied is not an error: the crash
    /// recovery path re-runs the move-to-history sequence.
    pub async fn delete_running(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&running_key(name)).await?;
        Ok(())
    }

    pub async fn get_running(&self, name: &str) -> StoreResult<Applied> {
        self.get(&running_key(name)).await
    }

    pub async fn list_running(&self, page_size: i64, cursor: &str) -> StoreResult<AppliedList> {
        self.list(APPLIED_RUNNING_DIR, page_size, cursor).await
    }

    pub async fn add_history(&self, applied: &Applied) -> StoreResult<()> {
        match self.create(&history_key(&applied.name), applied).await {
            // Re-running the move after a crash between the two writes.
            Err(StoreError::AppliedExists) => Ok(()),
            other => other,
        }
    }

    pub async fn delete_history(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&history_key(name)).await?;
        Ok(())
    }

    pub async fn get_history(&self, name: &str) -> StoreResult<Applied> {
        self.get(&history_key(name)).await
    }

    pub async fn list_history(&self, page_size: i64, cursor: &str) -> StoreResult<AppliedList> {
        self.list(APPLIED_HISTORY_DIR, page_size, cursor).await
    }

    /// Archive a finished applied: put into history, then drop from
    /// running. Idempotent under a crash between the two writes.
    pub async fn move_to_history(&self, applied: &Applied) -> StoreResult<()> {
        self.add_history(applied).await?;
        self.delete_running(&applied.name).await
    }

    async fn create(&self, key: &Key, applied: &Applied) -> StoreResult<()> {
        match self.client.create(key, applied.marshal()).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyExists) => Err(StoreError::AppliedExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, key: &Key, applied: &Applied) -> StoreResult<()> {
        match self.client.update(key, applied.marshal()).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyNotFound) => Err(StoreError::AppliedNotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, key: &Key) -> StoreResult<Applied> {
        match self.client.get_must_exist(key).await {
            Ok(raw) => Applied::unmarshal(&raw.value_str())
                .map_err(|e| StoreError::Corrupt(format!("applied: {e}"))),
            Err(KvError::KeyNotFound) => Err(StoreError::AppliedNotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str, page_size: i64, cursor: &str) -> StoreResult<AppliedList> {
        let page = self
            .client
            .list(ListOption {
                prefix: prefix.to_string(),
                size: page_size,
                cursor: cursor.to_string(),
                revision: 0,
            })
            .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for (_, raw) in &page.items {
            items.push(
                Applied::unmarshal(raw).map_err(|e| StoreError::Corrupt(format!("applied: {e}")))?,
            );
        }
        Ok(AppliedList {
            meta: ListMeta {
                total_count: page.total_count,
                total_page: page.total_page,
                current_page: page.current_page,
                has_next: page.more(),
                next_cursor: page.next_cursor,
            },
            items,
        })
    }
}
