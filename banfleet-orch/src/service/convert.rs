//! Model <-> wire conversions.

use banfleet_api::orch::v1::{control as control_pb, report as report_pb, rule as rule_pb, strategy as strategy_pb};
use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;

use crate::model::node::{Agent, AgentInfo, AgentStatus, ErrorTime};
use crate::model::rule::{Rule, RuleInfo, RuleMeta};
use crate::model::strategy::{Applied, AppliedStatus, Strategy, StrategyAction};

pub fn timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp { seconds: dt.timestamp(), nanos: dt.timestamp_subsec_nanos() as i32 }
}

pub fn datetime(ts: &Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn rule_info_from_pb(pb: &rule_pb::RuleInfo) -> RuleInfo {
    RuleInfo {
        cidr: pb.cidr.clone(),
        protocol: pb.protocol.clone(),
        sport: pb.sport as u16,
        dport: pb.dport as u16,
    }
}

pub fn rule_meta_to_pb(meta: &RuleMeta) -> rule_pb::RuleMeta {
    rule_pb::RuleMeta {
        comment: meta.comment.clone(),
        created_at: Some(timestamp(meta.created_at)),
        expires_at: Some(timestamp(meta.expires_at)),
        identity: meta.identity.clone(),
    }
}

pub fn rule_to_pb(rule: &Rule) -> rule_pb::Rule {
    rule_pb::Rule {
        info: Some(rule_pb::RuleInfo {
            cidr: rule.info.cidr.clone(),
            protocol: rule.info.protocol.clone(),
            sport: rule.info.sport as u32,
            dport: rule.info.dport as u32,
        }),
        meta: Some(rule_meta_to_pb(&rule.meta)),
    }
}

pub fn agent_info_to_pb(info: &AgentInfo) -> control_pb::AgentInfo {
    control_pb::AgentInfo {
        name: info.name.clone(),
        labels: info.labels.clone(),
        enable: info.enable,
        config: info.config.clone(),
    }
}

pub fn agent_status_to_pb(status: &AgentStatus) -> control_pb::AgentStatus {
    control_pb::AgentStatus {
        name: status.name.clone(),
        grpc_endpoint: status.grpc_endpoint.clone(),
        config: status.config.clone(),
        phase: status.phase.clone(),
        error: status.error.as_ref().map(|e| report_pb::ErrorTime {
            message: e.message.clone(),
            retry_at: Some(timestamp(e.retry_at)),
        }),
    }
}

pub fn agent_to_pb(agent: &Agent) -> control_pb::Agent {
    control_pb::Agent {
        info: agent.info.as_ref().map(agent_info_to_pb),
        status: agent.status.as_ref().map(agent_status_to_pb),
    }
}

pub fn status_from_report(pb: &report_pb::Status) -> AgentStatus {
    let phase = report_pb::Phase::try_from(pb.phase)
        .unwrap_or(report_pb::Phase::Ready)
        .as_status_str()
        .to_string();
    AgentStatus {
        name: pb.name.clone(),
        grpc_endpoint: pb.grpc_endpoint.clone(),
        config: pb.config_name.clone(),
        phase,
        error: pb.error.as_ref().map(|e| ErrorTime {
            message: e.message.clone(),
            retry_at: e.retry_at.as_ref().map(datetime).unwrap_or_else(Utc::now),
        }),
    }
}

pub fn strategy_from_pb(pb: &strategy_pb::Strategy) -> Strategy {
    Strategy {
        name: pb.name.clone(),
        name_selector: pb.name_selector.clone(),
        label_selector: pb.label_selector.clone(),
        action: action_from_str(&pb.action),
        value: pb.value.clone(),
    }
}

pub fn strategy_to_pb(strategy: &Strategy) -> strategy_pb::Strategy {
    strategy_pb::Strategy {
        name: strategy.name.clone(),
        name_selector: strategy.name_selector.clone(),
        label_selector: strategy.label_selector.clone(),
        action: strategy.action.map(action_str).unwrap_or_default().to_string(),
        value: strategy.value.clone(),
    }
}

pub fn applied_to_pb(applied: &Applied) -> strategy_pb::Applied {
    strategy_pb::Applied {
        name: applied.name.clone(),
        agents: applied.agents.clone(),
        action: action_str(applied.action).to_string(),
        value: applied.value.clone(),
        status: status_str(applied.status).to_string(),
        errors: applied.errors.clone(),
    }
}

pub fn action_from_str(action: &str) -> Option<StrategyAction> {
    match action {
        "config" => Some(StrategyAction::Config),
        "enable" => Some(StrategyAction::Enable),
        _ => None,
    }
}

pub fn action_str(action: StrategyAction) -> &'static str {
    match action {
        StrategyAction::Config => "config",
        StrategyAction::Enable => "enable",
    }
}

pub fn status_str(status: AppliedStatus) -> &'static str {
    match status {
        AppliedStatus::Pending => "pending",
        AppliedStatus::Running => "running",
        AppliedStatus::Success => "success",
        AppliedStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip() {
        let now = Utc.timestamp_opt(1_750_000_000, 123_000_000).single().unwrap();
        assert_eq!(datetime(&timestamp(now)), now);
    }

    #[test]
    fn unknown_action_strings_become_none() {
        assert_eq!(action_from_str("config"), Some(StrategyAction::Config));
        assert_eq!(action_from_str("enable"), Some(StrategyAction::Enable));
        assert_eq!(action_from_str("drop-tables"), None);
    }
}
