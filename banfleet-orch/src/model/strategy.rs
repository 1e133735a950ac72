//! Strategies select agents; applied strategies are their
//! materialization against a concrete agent set.

use serde::{Deserialize, Serialize};

use super::list::ListMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyAction {
    /// Set the named config on the selected agents.
    Config,
    /// Enable or disable the selected agents.
    Enable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    /// Regex over agent names; may be empty.
    #[serde(rename = "nameSelector", default)]
    pub name_selector: String,
    /// Regex over agent labels; may be empty.
    #[serde(rename = "labelSelector", default)]
    pub label_selector: String,
    pub action: Option<StrategyAction>,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl AppliedStatus {
    /// Terminal applieds live in history and are never reconciled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppliedStatus::Success | AppliedStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    /// Time-reversed unique name; newer applieds sort first.
    pub name: String,
    pub agents: Vec<String>,
    pub action: StrategyAction,
    pub value: String,
    pub status: AppliedStatus,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Applied {
    pub fn marshal(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn unmarshal(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Fixed-width, time-reversed name prefix: newer names sort before
/// older ones, so the newest application lists first.
pub fn unique_time_name(base: &str, now_ms: i64) -> String {
    const MAX_MS: i64 = 999_999_999_999_999; // 15 digits, far beyond any clock
    let reversed = MAX_MS - now_ms;
    format!("{reversed:014x}-{base}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyList {
    #[serde(flatten)]
    pub meta: ListMeta,
    pub items: Vec<Strategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppliedList {
    #[serde(flatten)]
    pub meta: ListMeta,
    pub items: Vec<Applied>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_applied_names_sort_first() {
        let older = unique_time_name("deny-edge", 1_000);
        let newer = unique_time_name("deny-edge", 2_000);
        assert!(newer < older);
    }

    #[test]
    fn applied_json_round_trips() {
        let applied = Applied {
            name: unique_time_name("s1", 42),
            agents: vec!["edge-a".to_string(), "edge-b".to_string()],
            action: StrategyAction::Enable,
            value: "false".to_string(),
            status: AppliedStatus::Pending,
            errors: vec![],
        };
        let parsed = Applied::unmarshal(&applied.marshal()).unwrap();
        assert_eq!(parsed, applied);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!AppliedStatus::Pending.is_terminal());
        assert!(!AppliedStatus::Running.is_terminal());
        assert!(AppliedStatus::Success.is_terminal());
        assert!(AppliedStatus::Failed.is_terminal());
    }
}
