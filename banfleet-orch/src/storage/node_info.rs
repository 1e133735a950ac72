//! Desired-state records for agents.

use banfleet_kv::{EtcdClient, KvError, ListOption, ListPager, Lister};

use crate::model::list::ListMeta;
use crate::model::node::AgentInfo;
use crate::storage::{info_key, StoreError, StoreResult, AGENT_INFO_DIR};

#[derive(Clone)]
pub struct InfoStorage {
    client: EtcdClient,
}

impl InfoStorage {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }

    pub async fn add(&self, info: &AgentInfo) -> StoreResult<()> {
        let value = marshal(info)?;
        match self.client.create(&info_key(&info.name), value).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyExists) => Err(StoreError::InfoExists),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update(&self, info: &AgentInfo) -> StoreResult<()> {
        let value = marshal(info)?;
        match self.client.update(&info_key(&info.name), value).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyNotFound) => Err(StoreError::InfoNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, name: &str) -> StoreResult<AgentInfo> {
        match self.client.get_must_exist(&info_key(name)).await {
            Ok(raw) => unmarshal(&raw.value_str()),
            Err(KvError::KeyNotFound) => Err(StoreError::InfoNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&info_key(name)).await?;
        Ok(())
    }

    pub async fn list(&self, page_size: i64, cursor: &str) -> StoreResult<(ListMeta, Vec<AgentInfo>)> {
        let page = self
            .client
            .list(ListOption {
                prefix: AGENT_INFO_DIR.to_string(),
                size: page_size,
                cursor: cursor.to_string(),
                revision: 0,
            })
            .await?;

        let mut items = Vec::with_capacity(page.items.len());
        for (_, raw) in &page.items {
            items.push(unmarshal(raw)?);
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

    /// Every agent info, for strategy materialization.
    pub async fn list_all(&self) -> StoreResult<Vec<AgentInfo>> {
        let pager = ListPager::new(20);
        let list = pager
            .list(
                &self.client as &dyn Lister<String>,
                ListOption { prefix: AGENT_INFO_DIR.to_string(), ..Default::default() },
            )
            .await?;

        let mut items = Vec::with_capacity(list.items.len());
        for (_, raw) in &list.items {
            items.push(unmarshal(raw)?);
        }
        Ok(items)
    }
}

fn marshal(info: &AgentInfo) -> StoreResult<String> {
    serde_json::to_string(info).map_err(|e| StoreError::Corrupt(format!("marshal agent info: {e}")))
}

fn unmarshal(raw: &str) -> StoreResult<AgentInfo> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("agent info: {e}")))
}
