//! Strategy CRUD.

use banfleet_kv::{EtcdClient, KvError, ListOption, Lister};

use crate::model::list::ListMeta;
use crate::model::strategy::{Strategy, StrategyList};
use crate::storage::{strategy_key, StoreError, StoreResult, STRATEGY_DIR};

#[derive(Clone)]
pub struct StrategyStorage {
    client: EtcdClient,
}

impl StrategyStorage {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }

    pub async fn add(&self, strategy: &Strategy) -> StoreResult<()> {
        match self.client.create(&strategy_key(&strategy.name), marshal(strategy)?).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyExists) => Err(StoreError::StrategyExists),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update(&self, strategy: &Strategy) -> StoreResult<()> {
        match self.client.update(&strategy_key(&strategy.name), marshal(strategy)?).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyNotFound) => Err(StoreError::StrategyNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, name: &str) -> StoreResult<Strategy> {
        match self.client.get_must_exist(&strategy_key(name)).await {
            Ok(raw) => unmarshal(&raw.value_str()),
            Err(KvError::KeyNotFound) => Err(StoreError::StrategyNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&strategy_key(name)).await?;
        Ok(())
    }

    pub async fn list(&self, page_size: i64, cursor: &str) -> StoreResult<StrategyList> {
        let page = self
            .client
            .list(ListOption {
                prefix: STRATEGY_DIR.to_string(),
                size: page_size,
                cursor: cursor.to_string(),
                revision: 0,
            })
            .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for (_, raw) in &page.items {
            items.push(unmarshal(raw)?);
        }
        Ok(StrategyList {
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

fn marshal(strategy: &Strategy) -> StoreResult<String> {
    serde_json::to_string(strategy).map_err(|e| StoreError::Corrupt(format!("marshal strategy: {e}")))
}

fn unmarshal(raw: &str) -> StoreResult<Strategy> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("strategy: {e}")))
}
