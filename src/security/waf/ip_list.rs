//! IP allow/deny lists with CIDR support, plus the reputation table fed by the
//! security monitor.

use dashmap::DashMap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::core::config::WafConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpListError {
    #[error("'{0}' is not an IP address")]
    InvalidAddress(String),
    #[error("'{0}' has an invalid prefix length")]
    InvalidPrefix(String),
}

/// A single address or a CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpMatcher(IpNet);

impl IpMatcher {
    /// Bare addresses become host blocks (`/32` or `/128`)
    pub fn parse(entry: &str) -> Result<Self, IpListError> {
        let entry = entry.trim();
        if let Ok(net) = entry.parse::<IpNet>() {
            return Ok(IpMatcher(net));
        }
        match entry.split_once('/') {
            Some((addr, _)) if addr.parse::<IpAddr>().is_ok() => {
                Err(IpListError::InvalidPrefix(entry.to_string()))
            }
            Some(_) => Err(IpListError::InvalidAddress(entry.to_string())),
            None => entry
                .parse::<IpAddr>()
                .ok()
                .and_then(host_net)
                .map(IpMatcher)
                .ok_or_else(|| IpListError::InvalidAddress(entry.to_string())),
        }
    }

    pub fn network(&self) -> IpNet {
        self.0
    }

    /// IPv4 and IPv4-mapped IPv6 forms of the same address both match
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.0.contains(&ip) {
            return true;
        }
        match ip {
            IpAddr::V4(v4) => self.0.contains(&IpAddr::V6(v4.to_ipv6_mapped())),
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map_or(false, |v4| self.0.contains(&IpAddr::V4(v4))),
        }
    }
}

fn host_net(ip: IpAddr) -> Option<IpNet> {
    match ip {
        IpAddr::V4(v4) => Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
        IpAddr::V6(v6) => Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Loopback, RFC 1918, link-local, or IPv6 unique-local
pub fn is_private_or_loopback(ip: IpAddr) -> bool {
    match normalize(ip) {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Compiled whitelist / blacklist, swapped as a whole on reload
#[derive(Debug, Clone, Default)]
pub struct IpLists {
    whitelist: Vec<IpMatcher>,
    blacklist: Vec<IpMatcher>,
    block_private: bool,
}

impl IpLists {
    pub fn new(whitelist: Vec<IpMatcher>, blacklist: Vec<IpMatcher>, block_private: bool) -> Self {
        Self {
            whitelist,
            blacklist,
            block_private,
        }
    }

    pub fn from_config(config: &WafConfig) -> Result<Self, IpListError> {
        let whitelist = config
            .ip_whitelist
            .iter()
            .map(|entry| IpMatcher::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        let blacklist = config
            .ip_blacklist
            .iter()
            .map(|entry| IpMatcher::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(whitelist, blacklist, config.block_private_ips))
    }

    /// Reason when the address is denied
    pub fn check(&self, ip: IpAddr) -> Option<&'static str> {
        if self.blacklist.iter().any(|m| m.contains(ip)) {
            return Some("IP in blacklist");
        }
        if !self.whitelist.is_empty() && !self.whitelist.iter().any(|m| m.contains(ip)) {
            return Some("IP not in whitelist");
        }
        if self.block_private && is_private_or_loopback(ip) {
            return Some("private or loopback address not allowed");
        }
        None
    }
}

/// Addresses flagged as suspicious, each until its expiry
#[derive(Debug, Default)]
pub struct IpReputation {
    flagged: DashMap<IpAddr, Instant>,
}

impl IpReputation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self, ip: IpAddr, ttl: Duration) {
        self.flagged.insert(ip, Instant::now() + ttl);
    }

    pub fn is_flagged(&self, ip: IpAddr) -> bool {
        let expired = match self.flagged.get(&ip) {
            Some(until) => *until <= Instant::now(),
            None => return false,
        };
        if expired {
            self.flagged.remove(&ip);
        }
        !expired
    }

    pub fn len(&self) -> usize {
        self.flagged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flagged.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_matching() {
        let block = IpMatcher::parse("10.1.0.0/16").unwrap();
        assert!(block.contains(ip("10.1.200.3")));
        assert!(!block.contains(ip("10.2.0.1")));
        assert!(block.contains(ip("::ffff:10.1.0.9")));

        let v6 = IpMatcher::parse("2001:db8::/32").unwrap();
        assert!(v6.contains(ip("2001:db8:1::1")));
        assert!(!v6.contains(ip("10.1.0.1")));

        assert!(IpMatcher::parse("0.0.0.0/0").unwrap().contains(ip("8.8.8.8")));
    }

    #[test]
    fn test_mapped_v6_block_matches_both_forms() {
        let mapped = IpMatcher::parse("::ffff:10.0.0.0/104").unwrap();
        assert!(mapped.contains(ip("::ffff:10.0.0.5")));
        assert!(mapped.contains(ip("10.0.0.5")));
        assert!(!mapped.contains(ip("10.1.0.5")));

        let host = IpMatcher::parse("192.0.2.9").unwrap();
        assert_eq!(host.network().prefix_len(), 32);
        assert!(host.contains(ip("::ffff:192.0.2.9")));
        assert!(!host.contains(ip("192.0.2.10")));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            IpMatcher::parse("10.0.0.0/33"),
            Err(IpListError::InvalidPrefix(_))
        ));
        assert!(matches!(
            IpMatcher::parse("not-an-ip"),
            Err(IpListError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_blacklist_then_whitelist_then_private_policy() {
        let lists = IpLists::new(
            vec![IpMatcher::parse("192.168.0.0/16").unwrap()],
            vec![IpMatcher::parse("192.168.1.66").unwrap()],
            false,
        );
        assert_eq!(lists.check(ip("192.168.1.66")), Some("IP in blacklist"));
        assert_eq!(lists.check(ip("203.0.113.1")), Some("IP not in whitelist"));
        assert_eq!(lists.check(ip("192.168.1.1")), None);

        let strict = IpLists::new(Vec::new(), Vec::new(), true);
        assert!(strict.check(ip("127.0.0.1")).is_some());
        assert!(strict.check(ip("fd00::1")).is_some());
        assert!(strict.check(ip("203.0.113.1")).is_none());
    }

    #[test]
    fn test_reputation_expires() {
        let reputation = IpReputation::new();
        reputation.flag(ip("198.51.100.4"), Duration::from_secs(60));
        reputation.flag(ip("198.51.100.5"), Duration::ZERO);
        assert!(reputation.is_flagged(ip("198.51.100.4")));
        assert!(!reputation.is_flagged(ip("198.51.100.5")));
        assert_eq!(reputation.len(), 1);
    }
}
