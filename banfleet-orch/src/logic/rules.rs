//! Rule validation and CRUD on top of the transactional storage.

use chrono::{Duration as ChronoDuration, Utc};

use crate::error::{AppError, AppResult};
use crate::model::rule::{Rule, RuleInfo, RuleList, RuleMeta};
use crate::storage::rule::RuleStorage;
use crate::storage::StoreError;

const PROTOCOLS: [&str; 3] = ["TCP", "UDP", "ICMP"];

pub struct RuleCenter {
    storage: RuleStorage,
}

impl RuleCenter {
    pub fn new(storage: RuleStorage) -> Self {
        Self { storage }
    }

    pub async fn add_rule(
        &self,
        ruleset: &str,
        info: &RuleInfo,
        comment: &str,
        duration_seconds: u64,
    ) -> AppResult<Rule> {
        validate(ruleset, info)?;
        if duration_seconds == 0 {
            return Err(AppError::input("rule duration must be greater than 0"));
        }

        let now = Utc::now();
        let mut meta = RuleMeta {
            comment: comment.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(duration_seconds as i64),
            identity: String::new(),
        };

        match self.storage.add(ruleset, info, &mut meta).await {
            Ok(()) => Ok(Rule { info: info.clone(), meta }),
            Err(StoreError::RuleAlreadyExists) => Err(AppError::already_exists("rule already exists")),
            Err(StoreError::RuleExpired) => Err(AppError::input("rule expiration must be in the future")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update_rule(
        &self,
        ruleset: &str,
        info: &RuleInfo,
        comment: &str,
        duration_seconds: u64,
    ) -> AppResult<()> {
        validate(ruleset, info)?;
        if duration_seconds == 0 {
            return Err(AppError::input("rule duration must be greater than 0"));
        }

        let now = Utc::now();
        let mut meta = RuleMeta {
            comment: comment.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(duration_seconds as i64),
            identity: String::new(),
        };

        match self.storage.update(ruleset, info, &mut meta).await {
            Ok(()) => Ok(()),
            Err(StoreError::RuleNotFound) => Err(AppError::not_found("rule not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_rule(&self, ruleset: &str, info: &RuleInfo) -> AppResult<()> {
        validate(ruleset, info)?;
        self.storage.delete(ruleset, info).await?;
        Ok(())
    }

    pub async fn get_rule(&self, ruleset: &str) -> AppResult<Vec<Rule>> {
        if ruleset.is_empty() {
            return Err(AppError::input("ruleset name is required"));
        }
        match self.storage.get(ruleset).await {
            Ok(rules) => Ok(rules),
            Err(StoreError::RuleNotFound) => Err(AppError::not_found("rule not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_rule(&self, page_size: i64, cursor: &str) -> AppResult<RuleList> {
        if page_size <= 0 {
            return Err(AppError::input("page size must be greater than 0"));
        }
        Ok(self.storage.list(page_size, cursor).await?)
    }
}

fn validate(ruleset: &str, info: &RuleInfo) -> AppResult<()> {
    if ruleset.is_empty() {
        return Err(AppError::input("ruleset name is required"));
    }
    info.cidr
        .parse::<ipnet::IpNet>()
        .map_err(|_| AppError::input(format!("invalid CIDR: {}", info.cidr)))?;
    if !PROTOCOLS.contains(&info.protocol.as_str()) {
        return Err(AppError::input(format!("invalid protocol: {}", info.protocol)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_rule(cidr: &str) -> RuleInfo {
        RuleInfo {
            cidr: cidr.to_string(),
            protocol: "TCP".to_string(),
            sport: 0,
            dport: 80,
        }
    }

    #[test]
    fn validation_accepts_v4_and_v6_cidrs() {
        assert!(validate("default", &tcp_rule("10.0.0.0/24")).is_ok());
        assert!(validate("default", &tcp_rule("2001:db8::/64")).is_ok());
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(validate("", &tcp_rule("10.0.0.0/24")).is_err());
        assert!(validate("default", &tcp_rule("10.0.0.0")).is_err());
        assert!(validate("default", &tcp_rule("not-a-cidr")).is_err());

        let mut bad_proto = tcp_rule("10.0.0.0/24");
        bad_proto.protocol = "GRE".to_string();
        assert!(validate("default", &bad_proto).is_err());
    }
}
