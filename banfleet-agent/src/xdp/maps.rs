//! The two kernel LPM-trie maps and the rule-to-entry encoding.
//!
//! `identity_ipcache` binds a source prefix to a 32-bit identity;
//! `xdp_banner_banlist` holds `(protocol, identity, sport, dport)`
//! match entries. The trie prefix length encodes match granularity,
//! counted in bits from the start of the key data.

use std::net::IpAddr;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::MapData;
use aya::Pod;
use parking_lot::Mutex;

use crate::error::{AgentError, AgentResult};

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Bits of ipcache key data before the address: pad(3) + family(1).
pub const IPCACHE_STATIC_PREFIX_BITS: u32 = 32;

/// Banlist granularities: protocol+identity, plus source and/or
/// destination port.
pub const BANLIST_L3_FULL: u32 = 64;
pub const BANLIST_L4_SPORT: u32 = 80;
pub const BANLIST_L4_DPORT: u32 = 96;
pub const BANLIST_L4_FULL: u32 = 96;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct IpcacheKey {
    pub pad1: u16,
    pub pad2: u8,
    pub family: u8,
    /// Both families; v4 occupies the lowest four bytes.
    pub ip: [u8; 16],
}

unsafe impl Pod for IpcacheKey {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct IdentityInfo {
    pub identity: u32,
}

unsafe impl Pod for IdentityInfo {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BanruleKey {
    pub pad1: u16,
    pub pad2: u8,
    pub protocol: u8,
    pub identity: u32,
    /// Network byte order.
    pub sport: u16,
    /// Network byte order.
    pub dport: u16,
}

unsafe impl Pod for BanruleKey {}

/// A rule as received from the watch stream, decoded for the maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    pub cidr: String,
    pub identity: String,
    pub protocol: u8,
    pub sport: u16,
    pub dport: u16,
}

pub fn protocol_number(protocol: &str) -> Option<u8> {
    match protocol {
        "TCP" => Some(IPPROTO_TCP),
        "UDP" => Some(IPPROTO_UDP),
        "ICMP" => Some(IPPROTO_ICMP),
        _ => None,
    }
}

/// Granularity of a banlist entry. Ports only narrow TCP/UDP matches.
pub fn banlist_prefix_len(protocol: u8, sport: u16, dport: u16) -> u32 {
    match protocol {
        IPPROTO_TCP | IPPROTO_UDP => match (sport != 0, dport != 0) {
            (true, true) => BANLIST_L4_FULL,
            (false, true) => BANLIST_L4_DPORT,
            (true, false) => BANLIST_L4_SPORT,
            (false, false) => BANLIST_L3_FULL,
        },
        _ => BANLIST_L3_FULL,
    }
}

fn encode_keys(rule: &IpRule) -> AgentResult<(Key<IpcacheKey>, IdentityInfo, Key<BanruleKey>)> {
    let net: ipnet::IpNet = rule
        .cidr
        .parse()
        .map_err(|_| AgentError::Xdp(format!("invalid CIDR {:?}", rule.cidr)))?;

    let mut ip_key = IpcacheKey::default();
    match net.addr() {
        IpAddr::V4(v4) => {
            ip_key.family = AF_INET;
            ip_key.ip[..4].copy_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            ip_key.family = AF_INET6;
            ip_key.ip.copy_from_slice(&v6.octets());
        }
    }

    let identity: u32 = rule
        .identity
        .parse()
        .map_err(|_| AgentError::Xdp(format!("invalid identity {:?}", rule.identity)))?;

    let ban_key = BanruleKey {
        pad1: 0,
        pad2: 0,
        protocol: rule.protocol,
        identity,
        sport: rule.sport.to_be(),
        dport: rule.dport.to_be(),
    };

    Ok((
        Key::new(IPCACHE_STATIC_PREFIX_BITS + u32::from(net.prefix_len()), ip_key),
        IdentityInfo { identity },
        Key::new(banlist_prefix_len(rule.protocol, rule.sport, rule.dport), ban_key),
    ))
}

/// Serialized writer over both kernel maps.
pub struct BanMaps {
    inner: Mutex<MapsInner>,
}

struct MapsInner {
    ipcache: LpmTrie<MapData, IpcacheKey, IdentityInfo>,
    banlist: LpmTrie<MapData, BanruleKey, u8>,
}

impl BanMaps {
    pub fn new(
        ipcache: LpmTrie<MapData, IpcacheKey, IdentityInfo>,
        banlist: LpmTrie<MapData, BanruleKey, u8>,
    ) -> Self {
        Self { inner: Mutex::new(MapsInner { ipcache, banlist }) }
    }

    /// Install a rule: bind the prefix to its identity, then add the
    /// banlist entry at the matching granularity.
    pub fn add_cidr_rule(&self, rule: &IpRule) -> AgentResult<()> {
        let (ip_key, identity, ban_key) = encode_keys(rule)?;
        let mut maps = self.inner.lock();
        maps.ipcache
            .insert(&ip_key, identity, 0)
            .map_err(|e| AgentError::Xdp(format!("update {}: {e}", super::IPCACHE_MAP)))?;
        maps.banlist
            .insert(&ban_key, 0, 0)
            .map_err(|e| AgentError::Xdp(format!("update {}: {e}", super::BANLIST_MAP)))?;
        Ok(())
    }

    /// Remove exactly the matching banlist entry. The identity binding
    /// stays: other rules for the same prefix may still use it.
    pub fn remove_cidr_rule(&self, rule: &IpRule) -> AgentResult<()> {
        let (_, _, ban_key) = encode_keys(rule)?;
        let mut maps = self.inner.lock();
        maps.banlist
            .remove(&ban_key)
            .map_err(|e| AgentError::Xdp(format!("delete from {}: {e}", super::BANLIST_MAP)))?;
        Ok(())
    }

    /// Empty both tries.
    pub fn clear(&self) -> AgentResult<()> {
        let mut maps = self.inner.lock();

        let ip_keys: Vec<Key<IpcacheKey>> = maps
            .ipcache
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| AgentError::Xdp(format!("iterate {}: {e}", super::IPCACHE_MAP)))?;
        for key in ip_keys {
            maps.ipcache
                .remove(&key)
                .map_err(|e| AgentError::Xdp(format!("clear {}: {e}", super::IPCACHE_MAP)))?;
        }

        let ban_keys: Vec<Key<BanruleKey>> = maps
            .banlist
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| AgentError::Xdp(format!("iterate {}: {e}", super::BANLIST_MAP)))?;
        for key in ban_keys {
            maps.banlist
                .remove(&key)
                .map_err(|e| AgentError::Xdp(format!("clear {}: {e}", super::BANLIST_MAP)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banlist_granularity_encoding() {
        assert_eq!(banlist_prefix_len(IPPROTO_TCP, 0, 0), BANLIST_L3_FULL);
        assert_eq!(banlist_prefix_len(IPPROTO_TCP, 1234, 0), BANLIST_L4_SPORT);
        assert_eq!(banlist_prefix_len(IPPROTO_TCP, 0, 80), BANLIST_L4_DPORT);
        assert_eq!(banlist_prefix_len(IPPROTO_TCP, 1234, 80), BANLIST_L4_FULL);
        // Ports never narrow ICMP.
        assert_eq!(banlist_prefix_len(IPPROTO_ICMP, 1234, 80), BANLIST_L3_FULL);
    }

    #[test]
    fn v4_rule_encodes_into_the_low_bytes() {
        let rule = IpRule {
            cidr: "10.0.0.0/24".to_string(),
            identity: "3009407147".to_string(),
            protocol: IPPROTO_TCP,
            sport: 0,
            dport: 80,
        };
        let (ip_key, identity, ban_key) = encode_keys(&rule).unwrap();

        assert_eq!(ip_key.prefix_len(), IPCACHE_STATIC_PREFIX_BITS + 24);
        assert_eq!(ip_key.data().family, AF_INET);
        assert_eq!(&ip_key.data().ip[..4], &[10, 0, 0, 0]);
        assert_eq!(ip_key.data().ip[4..], [0u8; 12]);

        assert_eq!(identity.identity, 3_009_407_147);
        assert_eq!(ban_key.prefix_len(), BANLIST_L4_DPORT);
        assert_eq!(ban_key.data().protocol, IPPROTO_TCP);
        assert_eq!(ban_key.data().sport, 0);
        assert_eq!(ban_key.data().dport, 80u16.to_be());
    }

    #[test]
    fn v6_rule_fills_the_whole_address() {
        let rule = IpRule {
            cidr: "2001:db8::/64".to_string(),
            identity: "1".to_string(),
            protocol: IPPROTO_UDP,
            sport: 53,
            dport: 0,
        };
        let (ip_key, _, ban_key) = encode_keys(&rule).unwrap();
        assert_eq!(ip_key.prefix_len(), IPCACHE_STATIC_PREFIX_BITS + 64);
        assert_eq!(ip_key.data().family, AF_INET6);
        assert_eq!(&ip_key.data().ip[..2], &[0x20, 0x01]);
        assert_eq!(ban_key.prefix_len(), BANLIST_L4_SPORT);
        assert_eq!(ban_key.data().sport, 53u16.to_be());
    }

    #[test]
    fn bad_cidr_and_identity_are_rejected() {
        let mut rule = IpRule {
            cidr: "not-a-cidr".to_string(),
            identity: "1".to_string(),
            protocol: IPPROTO_TCP,
            sport: 0,
            dport: 0,
        };
        assert!(encode_keys(&rule).is_err());

        rule.cidr = "10.0.0.0/24".to_string();
        rule.identity = "not-a-number".to_string();
        assert!(encode_keys(&rule).is_err());
    }

    #[test]
    fn protocol_names_map_to_ip_protocol_numbers() {
        assert_eq!(protocol_number("TCP"), Some(6));
        assert_eq!(protocol_number("UDP"), Some(17));
        assert_eq!(protocol_number("ICMP"), Some(1));
        assert_eq!(protocol_number("GRE"), None);
    }
}
