//! Etcd-backed storage, one module per resource kind.
//!
//! Key layout:
//!
//! ```text
//! /orch/cert/ca
//! /orch/cert/ca-private
//! /orch/node/info/{name}
//! /agent/node/register/{name}
//! /agent/node/info/{name}
//! /agent/node/status/{name}                       (leased)
//! /agent/rule/{ruleset}/{cidr}/{mask}/{proto}/{sport}-{dport}
//! /agent/rule/{ruleset}/{cidr}/                   (identity, leased)
//! /agent/ruleNames/
//! /agent/strategy/{name}
//! /agent/applied/running/{name}
//! /agent/applied/history/{name}
//! ```

pub mod applied;
pub mod cert;
pub mod node_info;
pub mod node_status;
pub mod orch_info;
pub mod register;
pub mod rule;
pub mod strategy;

use banfleet_kv::{Key, KvError};
use thiserror::Error;

use crate::model::rule::RuleInfo;

pub const AGENT_NODE_DIR: &str = "/agent/node/";
pub const AGENT_INFO_DIR: &str = "/agent/node/info/";
pub const AGENT_STATUS_DIR: &str = "/agent/node/status/";
pub const AGENT_REGISTER_DIR: &str = "/agent/node/register/";
pub const RULE_DIR: &str = "/agent/rule/";
pub const RULE_NAMES_KEY: &str = "/agent/ruleNames/";
pub const STRATEGY_DIR: &str = "/agent/strategy/";
pub const APPLIED_RUNNING_DIR: &str = "/agent/applied/running/";
pub const APPLIED_HISTORY_DIR: &str = "/agent/applied/history/";
pub const ORCH_INFO_DIR: &str = "/orch/node/info/";
pub const CERT_CA_KEY: &str = "/orch/cert/ca";
pub const CERT_CA_PRIVATE_KEY: &str = "/orch/cert/ca-private";

pub fn info_key(name: &str) -> Key {
    format!("{AGENT_INFO_DIR}{name}")
}

pub fn status_key(name: &str) -> Key {
    format!("{AGENT_STATUS_DIR}{name}")
}

pub fn register_key(name: &str) -> Key {
    format!("{AGENT_REGISTER_DIR}{name}")
}

pub fn ruleset_prefix(ruleset: &str) -> Key {
    format!("{RULE_DIR}{ruleset}/")
}

pub fn rule_key(ruleset: &str, info: &RuleInfo) -> Key {
    format!("{RULE_DIR}{ruleset}/{}", info.key())
}

pub fn identity_key(ruleset: &str, info: &RuleInfo) -> Key {
    format!("{RULE_DIR}{ruleset}/{}", info.identity_key())
}

pub fn strategy_key(name: &str) -> Key {
    format!("{STRATEGY_DIR}{name}")
}

pub fn running_key(name: &str) -> Key {
    format!("{APPLIED_RUNNING_DIR}{name}")
}

pub fn history_key(name: &str) -> Key {
    format!("{APPLIED_HISTORY_DIR}{name}")
}

pub fn orch_info_key(name: &str) -> Key {
    format!("{ORCH_INFO_DIR}{name}")
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed sentinels the logic layer translates into `AppError`s.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule not found")]
    RuleNotFound,
    #[error("rule already exists")]
    RuleAlreadyExists,
    #[error("rule expiration must be in the future")]
    RuleExpired,
    #[error("agent info not found")]
    InfoNotFound,
    #[error("agent info already exists")]
    InfoExists,
    #[error("agent status not found")]
    StatusNotFound,
    #[error("registration not found")]
    RegisterNotFound,
    #[error("registration already exists")]
    RegisterExists,
    #[error("strategy not found")]
    StrategyNotFound,
    #[error("strategy already exists")]
    StrategyExists,
    #[error("applied not found")]
    AppliedNotFound,
    #[error("applied already exists")]
    AppliedExists,
    #[error("orch info not found")]
    OrchInfoNotFound,
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}
