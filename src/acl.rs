use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::AclError;
use crate::peer::WildcardPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// One ACL rule: either a network/prefix-length pair or a hostname wildcard.
/// Rules are evaluated in order; spec.md §4.5.
#[derive(Debug, Clone)]
pub enum AclRule {
    Network { addr: IpAddr, prefix: u8 },
    Hostname(WildcardPattern),
}

impl AclRule {
    pub fn network(addr: IpAddr, prefix: u8) -> Self {
        Self::Network { addr, prefix }
    }

    pub fn hostname(pattern: &str) -> Self {
        Self::Hostname(WildcardPattern::compile(pattern))
    }

    fn matches_ip(&self, peer: IpAddr) -> bool {
        match self {
            Self::Network { addr, prefix } => match (addr, peer) {
                (IpAddr::V4(net), IpAddr::V4(peer)) => v4_matches(*net, peer, *prefix),
                (IpAddr::V6(net), IpAddr::V6(peer)) => v6_matches(*net, peer, *prefix),
                (IpAddr::V4(net), IpAddr::V6(peer)) => {
                    // IPv6 rule side is v4; only matches if the peer's IPv6 is v4-mapped.
                    match v4_mapped(peer) {
                        Some(mapped) => v4_matches(*net, mapped, *prefix),
                        None => false,
                    }
                }
                (IpAddr::V6(net), IpAddr::V4(peer)) => {
                    let mapped = v4_mapped_from_v4(peer);
                    v6_matches(*net, mapped, *prefix)
                }
            },
            Self::Hostname(_) => false,
        }
    }
}

fn v4_matches(net: Ipv4Addr, peer: Ipv4Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix.min(32)) };
    (u32::from(net) & mask) == (u32::from(peer) & mask)
}

fn v6_matches(net: Ipv6Addr, peer: Ipv6Addr, prefix: u8) -> bool {
    let net = net.octets();
    let peer = peer.octets();
    let full_words = (prefix / 8) as usize;
    let rem_bits = prefix % 8;
    if net[..full_words] != peer[..full_words] {
        return false;
    }
    if rem_bits == 0 || full_words >= 16 {
        return true;
    }
    let mask = 0xFFu8 << (8 - rem_bits);
    (net[full_words] & mask) == (peer[full_words] & mask)
}

/// Returns the embedded IPv4 address if `addr` is a v4-mapped IPv6 address (`::ffff:a.b.c.d`).
fn v4_mapped(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let seg = addr.segments();
    if seg[0..5] == [0, 0, 0, 0, 0] && seg[5] == 0xffff {
        let o = addr.octets();
        Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]))
    } else {
        None
    }
}

fn v4_mapped_from_v4(addr: Ipv4Addr) -> Ipv6Addr {
    addr.to_ipv6_mapped()
}

/// Per-protocol (TCP) admission-control rule list. UDP/GSS lists exist for
/// completeness in the source material but are not required by this core.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    rules: Vec<AclRule>,
    dns_enabled: bool,
}

impl Acl {
    pub fn new(rules: Vec<AclRule>, dns_enabled: bool) -> Self {
        Self { rules, dns_enabled }
    }

    /// `NeedDns` is returned when a rule is hostname-based but DNS resolution
    /// is disabled for this ACL; the caller decides whether to resolve and retry.
    pub fn check(&self, peer_ip: IpAddr, peer_fqdn: Option<&str>) -> Result<Verdict, AclError> {
        if self.rules.is_empty() {
            return Ok(Verdict::Allow);
        }

        let mut needs_dns = false;
        for rule in &self.rules {
            match rule {
                AclRule::Network { .. } => {
                    if rule.matches_ip(peer_ip) {
                        return Ok(Verdict::Allow);
                    }
                }
                AclRule::Hostname(pattern) => match peer_fqdn {
                    Some(fqdn) => {
                        if pattern.matches(fqdn) {
                            return Ok(Verdict::Allow);
                        }
                    }
                    None if self.dns_enabled => {
                        needs_dns = true;
                    }
                    None => {}
                },
            }
        }

        if needs_dns {
            return Err(AclError::NeedDns);
        }
        Ok(Verdict::Deny)
    }
}
