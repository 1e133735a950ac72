//! Rule-watch consumer: turns the orchestrator's rule stream into
//! kernel map mutations.

use std::sync::Arc;

use banfleet_api::orch::v1::rule::{EventType, WatchRuleResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::client::OrchClient;
use crate::xdp::maps::protocol_number;
use crate::xdp::{BanMaps, IpRule};

const EVENT_BUFFER: usize = 100;

/// Subscribe to `ruleset` and apply every event to the maps until the
/// scope is cancelled. The stream pump and the map writer are separate
/// tasks so a slow kernel update cannot stall the stream.
pub fn spawn(client: OrchClient, ruleset: String, maps: Arc<BanMaps>, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = client.watch_rules(&ruleset, tx, cancel).await {
                error!(error = %err, "rule watch ended");
            }
        });
    }

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            handle_event(&maps, &event);
        }
    });
}

fn handle_event(maps: &BanMaps, event: &WatchRuleResponse) {
    let Some((cidr, protocol_name, sport, dport)) = parse_rule_key(&event.rule_key) else {
        warn!(key = %event.rule_key, "unparseable rule key, skipping");
        return;
    };
    let Some(protocol) = protocol_number(&protocol_name) else {
        warn!(key = %event.rule_key, protocol = %protocol_name, "unknown protocol, skipping");
        return;
    };
    let Some(meta) = &event.rule_meta else {
        warn!(key = %event.rule_key, "rule event without metadata, skipping");
        return;
    };

    let rule = IpRule {
        cidr,
        identity: meta.identity.clone(),
        protocol,
        sport,
        dport,
    };

    let result = match EventType::try_from(event.event) {
        Ok(EventType::EventAdd) => maps.add_cidr_rule(&rule),
        Ok(EventType::EventDelete) => maps.remove_cidr_rule(&rule),
        Err(_) => {
            warn!(event = event.event, "unknown rule event type, skipping");
            return;
        }
    };
    if let Err(err) = result {
        error!(key = %event.rule_key, error = %err, "applying rule event failed");
    }
}

/// Parse `/agent/rule/{ruleset}/{ip}/{mask}/{proto}/{sport}-{dport}`
/// from the tail, so ruleset names and IPv6 addresses cannot confuse
/// the split.
pub(crate) fn parse_rule_key(key: &str) -> Option<(String, String, u16, u16)> {
    let parts: Vec<&str> = key.trim_matches('/').split('/').collect();
    if parts.len() < 7 {
        return None;
    }
    let ports = parts[parts.len() - 1];
    let protocol = parts[parts.len() - 2];
    let mask = parts[parts.len() - 3];
    let ip = parts[parts.len() - 4];

    let (sport, dport) = ports.split_once('-')?;
    Some((
        format!("{ip}/{mask}"),
        protocol.to_string(),
        sport.parse().ok()?,
        dport.parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_rule_keys() {
        let parsed = parse_rule_key("/agent/rule/default/10.0.0.0/24/TCP/0-80").unwrap();
        assert_eq!(parsed, ("10.0.0.0/24".to_string(), "TCP".to_string(), 0, 80));
    }

    #[test]
    fn parses_v6_rule_keys() {
        let parsed = parse_rule_key("/agent/rule/default/2001:da8:c807:20::/64/TCP/0-22").unwrap();
        assert_eq!(parsed, ("2001:da8:c807:20::/64".to_string(), "TCP".to_string(), 0, 22));
    }

    #[test]
    fn rejects_short_or_malformed_keys() {
        assert!(parse_rule_key("/agent/rule/default/10.0.0.0/24/").is_none());
        assert!(parse_rule_key("/agent/rule/default/10.0.0.0/24/TCP/80").is_none());
        assert!(parse_rule_key("/agent/ruleNames/").is_none());
    }
}
