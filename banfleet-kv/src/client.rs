//! Thin wrapper around `etcd-client` with typed errors and the basic
//! operations the storage layers compose: conditional create/update,
//! prefix deletes, leases, transactions.

use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp,
    TxnResponse,
};

use crate::error::{KvError, KvResult};
use crate::list_watch::RawKv;

/// Connection settings for the etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Cluster endpoints, e.g. `http://127.0.0.1:2379`.
    pub endpoints: Vec<String>,

    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            request_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}

/// Cloneable handle to the etcd cluster.
#[derive(Clone)]
pub struct EtcdClient {
    inner: Client,
}

impl EtcdClient {
    pub async fn connect(config: EtcdConfig) -> KvResult<Self> {
        let options = ConnectOptions::new()
            .with_timeout(Duration::from_millis(config.request_timeout_ms))
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms));

        let inner = Client::connect(&config.endpoints, Some(options)).await?;
        Ok(Self { inner })
    }

    /// Clone of the underlying client, for the election layer.
    pub fn raw(&self) -> Client {
        self.inner.clone()
    }

    pub async fn get(&self, key: &str) -> KvResult<Option<RawKv>> {
        let mut kv = self.inner.kv_client();
        let resp = kv.get(key, None).await?;
        Ok(resp.kvs().first().map(RawKv::from_kv))
    }

    /// Like [`get`](Self::get) but a missing key is an error.
    pub async fn get_must_exist(&self, key: &str) -> KvResult<RawKv> {
        self.get(key).await?.ok_or(KvError::KeyNotFound)
    }

    pub async fn get_prefix(&self, prefix: &str) -> KvResult<Vec<RawKv>> {
        let mut kv = self.inner.kv_client();
        let resp = kv.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        Ok(resp.kvs().iter().map(RawKv::from_kv).collect())
    }

    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>, lease_id: Option<i64>) -> KvResult<i64> {
        let mut kv = self.inner.kv_client();
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let resp = kv.put(key, value, options).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    /// Put that fails with [`KvError::KeyExists`] when the key is present.
    pub async fn create(&self, key: &str, value: impl Into<Vec<u8>>) -> KvResult<()> {
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.txn(txn).await?;
        if !resp.succeeded() {
            return Err(KvError::KeyExists);
        }
        Ok(())
    }

    /// Put that fails with [`KvError::KeyNotFound`] when the key is absent.
    pub async fn update(&self, key: &str, value: impl Into<Vec<u8>>) -> KvResult<()> {
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Greater, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.txn(txn).await?;
        if !resp.succeeded() {
            return Err(KvError::KeyNotFound);
        }
        Ok(())
    }

    /// Delete a key; returns the number of deleted keys.
    pub async fn delete(&self, key: &str) -> KvResult<i64> {
        let mut kv = self.inner.kv_client();
        let resp = kv.delete(key, None).await?;
        Ok(resp.deleted())
    }

    pub async fn delete_prefix(&self, prefix: &str) -> KvResult<i64> {
        let mut kv = self.inner.kv_client();
        let resp = kv
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await?;
        Ok(resp.deleted())
    }

    pub async fn txn(&self, txn: Txn) -> KvResult<TxnResponse> {
        let mut kv = self.inner.kv_client();
        Ok(kv.txn(txn).await?)
    }

    /// Grant a lease for the duration; sub-second durations are rejected.
    pub async fn grant(&self, ttl: Duration) -> KvResult<i64> {
        let secs = ttl.as_secs() as i64;
        if secs < 1 {
            return Err(KvError::LeaseTooShort);
        }
        let mut lease = self.inner.lease_client();
        let resp = lease.grant(secs, None).await?;
        Ok(resp.id())
    }

    /// Revoke a lease; an already-gone lease is not an error.
    pub async fn revoke(&self, lease_id: i64) -> KvResult<()> {
        let mut lease = self.inner.lease_client();
        match lease.revoke(lease_id).await {
            Ok(_) => Ok(()),
            Err(err) if is_lease_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Renew a lease once. Returns `false` when the lease no longer
    /// exists and a new one must be granted.
    pub async fn keep_alive_once(&self, lease_id: i64) -> KvResult<bool> {
        let mut lease = self.inner.lease_client();
        let (mut keeper, mut stream) = match lease.keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(err) if is_lease_not_found(&err) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        keeper.keep_alive().await?;
        match stream.message().await? {
            // etcd reports an expired lease with TTL <= 0.
            Some(resp) => Ok(resp.ttl() > 0),
            None => Ok(false),
        }
    }

    /// Etcd's `{prefix}` .. `getPrefixRangeEnd(prefix)` range end.
    pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.last_mut() {
            if *last < 0xff {
                *last += 1;
                return end;
            }
            end.pop();
        }
        // Prefix was all 0xff bytes: scan to the end of the keyspace.
        vec![0]
    }
}

fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    err.to_string().contains("lease not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_end_increments_last_byte() {
        assert_eq!(EtcdClient::prefix_range_end(b"/agent/"), b"/agent0".to_vec());
        assert_eq!(EtcdClient::prefix_range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(EtcdClient::prefix_range_end(b"\xff"), vec![0]);
    }
}
