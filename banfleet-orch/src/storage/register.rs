//! Registration records consumed by agents at `Init`.

use banfleet_kv::{EtcdClient, KvError, ListOption, Lister};

use crate::model::list::ListMeta;
use crate::model::node::Registration;
use crate::storage::{register_key, StoreError, StoreResult, AGENT_REGISTER_DIR};

#[derive(Clone)]
pub struct RegisterStorage {
    client: EtcdClient,
}

impl RegisterStorage {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }

    pub async fn add(&self, registration: &Registration) -> StoreResult<()> {
        let value = serde_json::to_string(registration)
            .map_err(|e| StoreError::Corrupt(format!("marshal registration: {e}")))?;
        match self.client.create(&register_key(&registration.name), value).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyExists) => Err(StoreError::RegisterExists),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, name: &str) -> StoreResult<Registration> {
        match self.client.get_must_exist(&register_key(name)).await {
            Ok(raw) => serde_json::from_slice(&raw.value)
                .map_err(|e| StoreError::Corrupt(format!("registration: {e}"))),
            Err(KvError::KeyNotFound) => Err(StoreError::RegisterNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&register_key(name)).await?;
        Ok(())
    }

    pub async fn list(&self, page_size: i64, cursor: &str) -> StoreResult<(ListMeta, Vec<Registration>)> {
        let page = self
            .client
            .list(ListOption {
                prefix: AGENT_REGISTER_DIR.to_string(),
                size: page_size,
                cursor: cursor.to_string(),
                revision: 0,
            })
            .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for (_, raw) in &page.items {
            items.push(
                serde_json::from_str(raw)
                    .map_err(|e| StoreError::Corrupt(format!("registration: {e}")))?,
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
