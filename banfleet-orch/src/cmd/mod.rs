//! Subcommand implementations.

pub mod init;
pub mod join;
pub mod reset;
pub mod server;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use banfleet_kv::{EtcdClient, EtcdConfig};

use crate::error::{AppError, AppResult};

pub async fn connect(config: &EtcdConfig) -> AppResult<EtcdClient> {
    EtcdClient::connect(config.clone())
        .await
        .map_err(|e| AppError::service(format!("connect to etcd: {e}")))
}

/// SANs for a server certificate dialed over loopback.
pub(crate) fn localhost_sans() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
}
