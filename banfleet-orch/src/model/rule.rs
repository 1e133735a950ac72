//! Rules: a `(cidr, protocol, sport, dport)` tuple to drop, grouped
//! under a ruleset name, with leased metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// The matching tuple. Encoded into the rule's KV key as
/// `{cidr}/{mask}/{proto}/{sport}-{dport}` (the CIDR itself carries a
/// slash, so the key tail has four segments).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub cidr: String,
    pub protocol: String,
    pub sport: u16,
    pub dport: u16,
}

impl RuleInfo {
    /// Relative key of this rule under its ruleset prefix.
    pub fn key(&self) -> String {
        format!("{}/{}/{}-{}", self.cidr, self.protocol, self.sport, self.dport)
    }

    /// Relative key of the per-CIDR identity record.
    pub fn identity_key(&self) -> String {
        format!("{}/", self.cidr)
    }

    /// Parse the tail of a rule key back into a tuple. The tail is
    /// everything after `/agent/rule/{ruleset}/`.
    pub fn parse_key_tail(tail: &str) -> AppResult<Self> {
        let parts: Vec<&str> = tail.trim_matches('/').split('/').collect();
        if parts.len() != 4 {
            return Err(AppError::input(format!("malformed rule key tail: {tail}")));
        }
        let cidr = format!("{}/{}", parts[0], parts[1]);
        let protocol = parts[2].to_string();
        let (sport, dport) = parts[3]
            .split_once('-')
            .ok_or_else(|| AppError::input(format!("malformed port pair in rule key: {tail}")))?;
        Ok(Self {
            cidr,
            protocol,
            sport: sport
                .parse()
                .map_err(|_| AppError::input(format!("bad sport in rule key: {tail}")))?,
            dport: dport
                .parse()
                .map_err(|_| AppError::input(format!("bad dport in rule key: {tail}")))?,
        })
    }
}

/// Metadata stored as the rule's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMeta {
    pub comment: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Decimal u32, shared by every rule with this CIDR in the ruleset.
    pub identity: String,
}

impl RuleMeta {
    pub fn marshal(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn unmarshal(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::service(format!("unmarshal rule meta failed: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub info: RuleInfo,
    pub meta: RuleMeta,
}

/// One page of rulesets with their rules.
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    pub total_count: i64,
    pub has_next: bool,
    pub next_cursor: String,
    pub items: Vec<(String, Vec<Rule>)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_key_round_trips() {
        let info = RuleInfo {
            cidr: "10.0.0.0/24".to_string(),
            protocol: "TCP".to_string(),
            sport: 0,
            dport: 80,
        };
        assert_eq!(info.key(), "10.0.0.0/24/TCP/0-80");
        assert_eq!(info.identity_key(), "10.0.0.0/24/");
        assert_eq!(RuleInfo::parse_key_tail("10.0.0.0/24/TCP/0-80").unwrap(), info);
    }

    #[test]
    fn ipv6_rule_key_round_trips() {
        let info = RuleInfo {
            cidr: "2001:db8::/64".to_string(),
            protocol: "UDP".to_string(),
            sport: 53,
            dport: 0,
        };
        assert_eq!(RuleInfo::parse_key_tail(&info.key()).unwrap(), info);
    }

    #[test]
    fn malformed_key_tails_are_rejected() {
        assert!(RuleInfo::parse_key_tail("10.0.0.0/24/TCP").is_err());
        assert!(RuleInfo::parse_key_tail("10.0.0.0/24/TCP/80").is_err());
        assert!(RuleInfo::parse_key_tail("10.0.0.0/24/TCP/a-b").is_err());
    }
}
