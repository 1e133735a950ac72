//! Strategy validation and the materialization of strategies into
//! applied objects.

use chrono::Utc;
use regex::Regex;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::model::node::AgentInfo;
use crate::model::strategy::{
    unique_time_name, Applied, AppliedList, AppliedStatus, Strategy, StrategyList,
};
use crate::storage::applied::AppliedStorage;
use crate::storage::node_info::InfoStorage;
use crate::storage::strategy::StrategyStorage;
use crate::storage::StoreError;

const DEFAULT_PAGE_SIZE: i64 = 10;

pub struct StrategyLogic {
    storage: StrategyStorage,
}

impl StrategyLogic {
    pub fn new(storage: StrategyStorage) -> Self {
        Self { storage }
    }

    pub async fn add(&self, strategy: &Strategy) -> AppResult<()> {
        validate_strategy(strategy)?;
        match self.storage.add(strategy).await {
            Ok(()) => Ok(()),
            Err(StoreError::StrategyExists) => {
                Err(AppError::already_exists("strategy already exists, please use another name"))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update(&self, strategy: &Strategy) -> AppResult<()> {
        validate_strategy(strategy)?;
        match self.storage.update(strategy).await {
            Ok(()) => Ok(()),
            Err(StoreError::StrategyNotFound) => Err(AppError::not_found("strategy not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> AppResult<()> {
        self.storage.delete(name).await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> AppResult<Strategy> {
        match self.storage.get(name).await {
            Ok(strategy) => Ok(strategy),
            Err(StoreError::StrategyNotFound) => Err(AppError::not_found("strategy not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list(&self, page_size: i64, cursor: &str) -> AppResult<StrategyList> {
        let page_size = normalize_page_size(page_size)?;
        Ok(self.storage.list(page_size, cursor).await?)
    }
}

pub struct AppliedLogic {
    strategies: StrategyStorage,
    agents: InfoStorage,
    applieds: AppliedStorage,
}

impl AppliedLogic {
    pub fn new(strategies: StrategyStorage, agents: InfoStorage, applieds: AppliedStorage) -> Self {
        Self { strategies, agents, applieds }
    }

    /// Materialize `strategy_name` against the current agent set and
    /// queue the applied object for the strategy controller.
    pub async fn create(&self, strategy_name: &str) -> AppResult<()> {
        let strategy = match self.strategies.get(strategy_name).await {
            Ok(s) => s,
            Err(StoreError::StrategyNotFound) => return Err(AppError::not_found("strategy not found")),
            Err(err) => return Err(err.into()),
        };
        let action = strategy
            .action
            .ok_or_else(|| AppError::input("strategy has no action"))?;

        let selectors = Selectors::compile(&strategy)?;
        let agents = self.agents.list_all().await?;
        let selected: Vec<String> = agents
            .iter()
            .filter(|agent| selectors.matches(agent))
            .map(|agent| agent.name.clone())
            .collect();
        if selected.is_empty() {
            warn!(strategy = %strategy_name, "strategy selected no agents");
        }

        let applied = Applied {
            name: unique_time_name(&strategy.name, Utc::now().timestamp_millis()),
            agents: selected,
            action,
            value: strategy.value.clone(),
            status: AppliedStatus::Pending,
            errors: Vec::new(),
        };

        self.applieds.add_running(&applied).await?;
        Ok(())
    }

    pub async fn move_to_history(&self, applied: &Applied) -> AppResult<()> {
        Ok(self.applieds.move_to_history(applied).await?)
    }

    pub async fn get_running(&self, name: &str) -> AppResult<Applied> {
        match self.applieds.get_running(name).await {
            Ok(applied) => Ok(applied),
            Err(StoreError::AppliedNotFound) => Err(AppError::not_found("applied not found")),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_running(&self, page_size: i64, cursor: &str) -> AppResult<AppliedList> {
        let page_size = normalize_page_size(page_size)?;
        Ok(self.applieds.list_running(page_size, cursor).await?)
    }

    pub async fn list_history(&self, page_size: i64, cursor: &str) -> AppResult<AppliedList> {
        let page_size = normalize_page_size(page_size)?;
        Ok(self.applieds.list_history(page_size, cursor).await?)
    }

    pub async fn delete_history(&self, name: &str) -> AppResult<()> {
        self.applieds.delete_history(name).await?;
        Ok(())
    }
}

struct Selectors {
    name: Option<Regex>,
    label: Option<Regex>,
}

impl Selectors {
    fn compile(strategy: &Strategy) -> AppResult<Self> {
        let name = compile_selector(&strategy.name_selector, "name selector")?;
        let label = compile_selector(&strategy.label_selector, "label selector")?;
        Ok(Self { name, label })
    }

    fn matches(&self, agent: &AgentInfo) -> bool {
        if let Some(re) = &self.name {
            if re.is_match(&agent.name) {
                return true;
            }
        }
        if let Some(re) = &self.label {
            if agent.labels.iter().any(|label| re.is_match(label)) {
                return true;
            }
        }
        false
    }
}

fn compile_selector(pattern: &str, what: &str) -> AppResult<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|_| AppError::input(format!("{what} is not a valid regular expression: {pattern}")))
}

fn normalize_page_size(page_size: i64) -> AppResult<i64> {
    if page_size < 0 {
        return Err(AppError::input("page size must be greater than 0"));
    }
    Ok(if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size })
}

fn validate_strategy(strategy: &Strategy) -> AppResult<()> {
    if strategy.name.is_empty() {
        return Err(AppError::input("strategy name is empty"));
    }
    if strategy.action.is_none() {
        return Err(AppError::input("invalid strategy action"));
    }
    if strategy.name_selector.is_empty() && strategy.label_selector.is_empty() {
        return Err(AppError::input("strategy name selector and label selector are both empty"));
    }
    compile_selector(&strategy.name_selector, "strategy name selector")?;
    compile_selector(&strategy.label_selector, "strategy label selector")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::strategy::StrategyAction;

    fn strategy(name_sel: &str, label_sel: &str) -> Strategy {
        Strategy {
            name: "s1".to_string(),
            name_selector: name_sel.to_string(),
            label_selector: label_sel.to_string(),
            action: Some(StrategyAction::Enable),
            value: "false".to_string(),
        }
    }

    fn agent(name: &str, labels: &[&str]) -> AgentInfo {
        AgentInfo {
            name: name.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            enable: true,
            config: "default".to_string(),
        }
    }

    #[test]
    fn validation_requires_a_selector_and_compiling_regexes() {
        assert!(validate_strategy(&strategy("edge-.*", "")).is_ok());
        assert!(validate_strategy(&strategy("", "")).is_err());
        assert!(validate_strategy(&strategy("[", "")).is_err());

        let mut no_action = strategy("edge-.*", "");
        no_action.action = None;
        assert!(validate_strategy(&no_action).is_err());
    }

    #[test]
    fn label_selector_matches_any_label() {
        let selectors = Selectors::compile(&strategy("", "edge-.*")).unwrap();
        assert!(selectors.matches(&agent("n1", &["edge-a"])));
        assert!(selectors.matches(&agent("n2", &["core", "edge-b"])));
        assert!(!selectors.matches(&agent("n3", &["core"])));
    }

    #[test]
    fn name_selector_wins_without_labels() {
        let selectors = Selectors::compile(&strategy("edge-.*", "")).unwrap();
        assert!(selectors.matches(&agent("edge-a", &[])));
        assert!(!selectors.matches(&agent("core-a", &[])));
    }
}
