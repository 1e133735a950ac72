//! Orchestrator membership records.

use banfleet_kv::{EtcdClient, KvError, ListOption, Lister};

use crate::model::list::ListMeta;
use crate::model::node::OrchInfo;
use crate::storage::{orch_info_key, StoreError, StoreResult, ORCH_INFO_DIR};

#[derive(Clone)]
pub struct OrchInfoStorage {
    client: EtcdClient,
}

impl OrchInfoStorage {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }

    /// Membership is an upsert: a restarting orch re-announces itself.
    pub async fn put(&self, info: &OrchInfo) -> StoreResult<()> {
        let value = serde_json::to_string(info)
            .map_err(|e| StoreError::Corrupt(format!("marshal orch info: {e}")))?;
        self.client.put(&orch_info_key(&info.name), value, None).await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> StoreResult<OrchInfo> {
        match self.client.get_must_exist(&orch_info_key(name)).await {
            Ok(raw) => serde_json::from_slice(&raw.value)
                .map_err(|e| StoreError::Corrupt(format!("orch info: {e}"))),
            Err(KvError::KeyNotFound) => Err(StoreError::OrchInfoNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&orch_info_key(name)).await?;
        Ok(())
    }

    pub async fn list(&self, page_size: i64, cursor: &str) -> StoreResult<(ListMeta, Vec<OrchInfo>)> {
        let page = self
            .client
            .list(ListOption {
                prefix: ORCH_INFO_DIR.to_string(),
                size: page_size,
                cursor: cursor.to_string(),
                revision: 0,
            })
            .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for (_, raw) in &page.items {
            items.push(
                serde_json::from_str(raw)
                    .map_err(|e| StoreError::Corrupt(format!("orch info: {e}")))?,
            );
        }
        Ok((
            ListMeta {
                total_count: page.total_count,
                total_page: page.total_page,
                current_page: page.current_page,
                has_next: page.more(),
                next_cursor: page.next_cursor,
            },
            items,
        ))
    }
}
