//! Cluster CA storage. The certificate is read on every agent `Init`,
//! so reads go through the write-through cache; the encrypted private
//! key is fetched directly and never cached.

use std::time::Duration;

use banfleet_kv::cache::WriteThroughCache;
use banfleet_kv::{EtcdClient, KvError};

use crate::storage::{StoreError, StoreResult, CERT_CA_KEY, CERT_CA_PRIVATE_KEY};

const CA_CACHE_FORCE_REFRESH: i64 = 64;
const CA_CACHE_TTL: Duration = Duration::from_secs(600);
const CA_CACHE_CLEANUP: Duration = Duration::from_secs(60);

pub struct CertStorage {
    client: EtcdClient,
    ca_cache: WriteThroughCache,
}

impl CertStorage {
    pub fn new(client: EtcdClient) -> Self {
        let ca_cache = WriteThroughCache::new(
            client.clone(),
            CA_CACHE_FORCE_REFRESH,
            CA_CACHE_TTL,
            CA_CACHE_CLEANUP,
        );
        Self { client, ca_cache }
    }

    /// Store the cluster CA pair; both keys must be absent.
    pub async fn init(&self, ca_pem: &str, encrypted_key_pem: &str) -> StoreResult<()> {
        match self.client.create(CERT_CA_KEY, ca_pem).await {
            Ok(()) => {}
            Err(KvError::KeyExists) => return Err(StoreError::Corrupt("cluster CA already initialized".into())),
            Err(err) => return Err(err.into()),
        }
        self.client.create(CERT_CA_PRIVATE_KEY, encrypted_key_pem).await?;
        Ok(())
    }

    pub async fn ca(&self) -> StoreResult<String> {
        match self.ca_cache.get(CERT_CA_KEY, false).await? {
            Some((value, _)) => Ok(value),
            None => Err(StoreError::Corrupt("cluster CA not initialized".into())),
        }
    }

    pub async fn ca_private(&self) -> StoreResult<String> {
        match self.client.get_must_exist(CERT_CA_PRIVATE_KEY).await {
            Ok(raw) => Ok(raw.value_str()),
            Err(KvError::KeyNotFound) => Err(StoreError::Corrupt("cluster CA key not initialized".into())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn clear(&self) -> StoreResult<()> {
        self.client.delete(CERT_CA_KEY).await?;
        self.client.delete(CERT_CA_PRIVATE_KEY).await?;
        self.ca_cache.close();
        Ok(())
    }
}
