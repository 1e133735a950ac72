//! Business logic between the storage layer and the gRPC services.
//!
//! Storage sentinels become typed [`AppError`](crate::error::AppError)s
//! here; nothing below this layer knows about gRPC.

pub mod control;
pub mod rules;
pub mod strategy;

use std::sync::Arc;

use banfleet_kv::EtcdClient;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::storage::applied::AppliedStorage;
use crate::storage::cert::CertStorage;
use crate::storage::node_info::InfoStorage;
use crate::storage::node_status::StatusStorage;
use crate::storage::orch_info::OrchInfoStorage;
use crate::storage::register::RegisterStorage;
use crate::storage::rule::RuleStorage;
use crate::storage::strategy::StrategyStorage;
use crate::storage::StoreError;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RuleNotFound
            | StoreError::InfoNotFound
            | StoreError::StatusNotFound
            | StoreError::RegisterNotFound
            | StoreError::StrategyNotFound
            | StoreError::AppliedNotFound
            | StoreError::OrchInfoNotFound => AppError::not_found(err.to_string()),
            StoreError::RuleAlreadyExists
            | StoreError::InfoExists
            | StoreError::RegisterExists
            | StoreError::StrategyExists
            | StoreError::AppliedExists => AppError::already_exists(err.to_string()),
            StoreError::RuleExpired => AppError::input(err.to_string()),
            StoreError::Corrupt(msg) => AppError::service(msg),
            StoreError::Kv(kv) => kv.into(),
        }
    }
}

/// Everything the services and controllers need, wired once at startup.
pub struct Logic {
    pub control: Arc<control::Control>,
    pub rules: Arc<rules::RuleCenter>,
    pub strategy: Arc<strategy::StrategyLogic>,
    pub applied: Arc<strategy::AppliedLogic>,
    pub orch_infos: OrchInfoStorage,
}

impl Logic {
    pub fn new(client: EtcdClient, cluster_secret: String, cancel: CancellationToken) -> Self {
        let registers = RegisterStorage::new(client.clone());
        let infos = InfoStorage::new(client.clone());
        let statuses = StatusStorage::new(client.clone(), cancel);
        let certs = Arc::new(CertStorage::new(client.clone()));
        let rules = RuleStorage::new(client.clone());
        let strategies = StrategyStorage::new(client.clone());
        let applieds = AppliedStorage::new(client.clone());

        let control = Arc::new(control::Control::new(
            registers,
            infos.clone(),
            statuses,
            certs,
            cluster_secret,
        ));
        let strategy = Arc::new(strategy::StrategyLogic::new(strategies.clone()));
        let applied = Arc::new(strategy::AppliedLogic::new(strategies, infos, applieds));

        Self {
            control,
            rules: Arc::new(rules::RuleCenter::new(rules)),
            strategy,
            applied,
            orch_infos: OrchInfoStorage::new(client),
        }
    }
}
