//! First-match-wins packet evaluation over a rule set
//!
//! Used to prove reachability after an apply and to explain why a port is
//! blocked. Evaluation is local and pure: no packet ever leaves the host.

use crate::core::policy::Transport;
use crate::core::ruleset::{
    AddrTarget, CtState, Direction, Family, L4Proto, Match, PortTarget, Rule, RuleSet, Verdict,
};
use crate::utils::matches_pattern;
use std::net::IpAddr;

/// Transport header of a synthetic packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4 {
    Tcp(u16),
    Udp(u16),
    /// ICMP echo; `ipv6-icmp` for IPv6 packets
    Icmp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub l4: L4,
    pub iif: Option<String>,
    pub oif: Option<String>,
    pub ct_state: CtState,
}

impl Packet {
    /// A new connection from `saddr` to `daddr`
    pub fn new(saddr: IpAddr, daddr: IpAddr, l4: L4) -> Self {
        Self {
            saddr,
            daddr,
            l4,
            iif: None,
            oif: None,
            ct_state: CtState::New,
        }
    }

    pub fn to_port(saddr: IpAddr, daddr: IpAddr, protocol: Transport, port: u16) -> Self {
        let l4 = match protocol {
            Transport::Tcp => L4::Tcp(port),
            Transport::Udp => L4::Udp(port),
        };
        Self::new(saddr, daddr, l4)
    }

    #[must_use]
    pub fn via_iif(mut self, name: impl Into<String>) -> Self {
        self.iif = Some(name.into());
        self
    }

    #[must_use]
    pub fn via_oif(mut self, name: impl Into<String>) -> Self {
        self.oif = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: CtState) -> Self {
        self.ct_state = state;
        self
    }

    pub fn family(&self) -> Family {
        Family::of(&self.saddr)
    }

    pub fn l4proto(&self) -> L4Proto {
        match (self.l4, self.family()) {
            (L4::Tcp(_), _) => L4Proto::Tcp,
            (L4::Udp(_), _) => L4Proto::Udp,
            (L4::Icmp, Family::V4) => L4Proto::Icmp,
            (L4::Icmp, Family::V6) => L4Proto::Icmpv6,
        }
    }

    fn dport(&self, protocol: Transport) -> Option<u16> {
        match (self.l4, protocol) {
            (L4::Tcp(port), Transport::Tcp) | (L4::Udp(port), Transport::Udp) => Some(port),
            _ => None,
        }
    }
}

/// Outcome of running a packet through one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Index of the deciding rule; `None` when the chain policy applied
    pub rule_index: Option<usize>,
    pub comment: Option<String>,
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }

    /// Human-readable description of what decided
    pub fn describe(&self) -> String {
        match (self.rule_index, &self.comment) {
            (Some(i), Some(c)) => format!("{} by rule #{i} ({c})", self.verdict),
            (Some(i), None) => format!("{} by rule #{i}", self.verdict),
            (None, _) => format!("{} by chain policy", self.verdict),
        }
    }
}

/// Runs `packet` through chain `chain` of `ruleset`.
///
/// Returns `None` if the chain does not exist.
pub fn evaluate(ruleset: &RuleSet, chain: &str, packet: &Packet) -> Option<Decision> {
    let chain = ruleset.chain(chain)?;

    for (index, rule) in chain.rules.iter().enumerate() {
        let Some(verdict) = rule.verdict else {
            continue;
        };
        if rule_matches(ruleset, rule, packet) {
            return Some(Decision {
                verdict,
                rule_index: Some(index),
                comment: rule.comment.clone(),
            });
        }
    }

    Some(Decision {
        verdict: chain.policy.into(),
        rule_index: None,
        comment: None,
    })
}

/// All rules of `chain` that match `packet`, in evaluation order
pub fn matching_rules<'a>(ruleset: &'a RuleSet, chain: &str, packet: &Packet) -> Vec<(usize, &'a Rule)> {
    ruleset
        .chain(chain)
        .map(|c| {
            c.rules
                .iter()
                .enumerate()
                .filter(|(_, rule)| rule_matches(ruleset, rule, packet))
                .collect()
        })
        .unwrap_or_default()
}

pub fn rule_matches(ruleset: &RuleSet, rule: &Rule, packet: &Packet) -> bool {
    rule.matches.iter().all(|m| match_one(ruleset, m, packet))
}

fn match_one(ruleset: &RuleSet, m: &Match, packet: &Packet) -> bool {
    match m {
        Match::IifName { pattern, negated } => {
            matches_pattern(pattern, packet.iif.as_deref().unwrap_or("")) != *negated
        }
        Match::OifName { pattern, negated } => {
            matches_pattern(pattern, packet.oif.as_deref().unwrap_or("")) != *negated
        }
        Match::CtState(states) => states.contains(&packet.ct_state),
        Match::L4Proto(protos) => protos.contains(&packet.l4proto()),
        Match::Addr {
            family,
            direction,
            target,
        } => {
            if *family != packet.family() {
                return false;
            }
            let addr = match direction {
                Direction::Source => packet.saddr,
                Direction::Destination => packet.daddr,
            };
            match target {
                AddrTarget::Set(name) => ruleset.set(name).is_some_and(|s| s.contains_addr(addr)),
                AddrTarget::Prefix(net) => net.contains(addr),
            }
        }
        Match::Dport { protocol, target } => {
            let Some(port) = packet.dport(*protocol) else {
                return false;
            };
            match target {
                PortTarget::Set(name) => ruleset.set(name).is_some_and(|s| s.contains_port(port)),
                PortTarget::Single(p) => *p == port,
                PortTarget::Range(a, b) => (*a..=*b).contains(&port),
            }
        }
        Match::Unknown(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::compile;
    use crate::core::test_helpers::{SCENARIO_POLICY, load};

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_scenario_control_plane_ports_accepted() {
        let ruleset = compile(&load(SCENARIO_POLICY), "knfw");
        for port in [6443, 10250] {
            let packet = Packet::to_port(addr("10.42.0.1"), addr("192.0.2.1"), Transport::Tcp, port)
                .via_iif("eth0");
            let decision = evaluate(&ruleset, "input", &packet).unwrap();
            assert!(decision.is_accept(), "port {port}: {}", decision.describe());
            assert_eq!(decision.rule_index, Some(3));
        }

        let packet = Packet::to_port(addr("10.42.0.1"), addr("192.0.2.1"), Transport::Tcp, 22)
            .via_iif("eth0");
        let decision = evaluate(&ruleset, "input", &packet).unwrap();
        assert_eq!(decision.verdict, Verdict::Drop);
        assert_eq!(decision.rule_index, None);
    }

    #[test]
    fn test_first_match_wins_over_later_deny() {
        let policy = load(
            r#"{
                "cidr_sets": {
                    "cluster": { "cluster": true, "entries": ["10.42.0.0/16"] },
                    "suspicious": { "entries": ["10.42.7.0/24"] }
                },
                "chains": { "input": { "clauses": [
                    {"kind": "cluster_cidr", "sources": "cluster"},
                    {"kind": "cluster_cidr", "sources": "suspicious", "action": "drop"}
                ] } }
            }"#,
        );
        let ruleset = compile(&policy, "knfw");
        let packet = Packet::to_port(addr("10.42.7.9"), addr("192.0.2.1"), Transport::Tcp, 8080);
        let decision = evaluate(&ruleset, "input", &packet).unwrap();
        assert!(decision.is_accept());
        assert_eq!(matching_rules(&ruleset, "input", &packet).len(), 2);
    }

    #[test]
    fn test_loopback_and_established_fast_path() {
        let ruleset = compile(&load("{}"), "knfw");
        let packet = Packet::to_port(addr("127.0.0.1"), addr("127.0.0.1"), Transport::Tcp, 5000)
            .via_iif("lo");
        assert!(evaluate(&ruleset, "input", &packet).unwrap().is_accept());

        let packet = Packet::to_port(addr("203.0.113.5"), addr("192.0.2.1"), Transport::Tcp, 5000)
            .via_iif("eth0")
            .with_state(CtState::Established);
        assert!(evaluate(&ruleset, "input", &packet).unwrap().is_accept());

        let packet = Packet::to_port(addr("203.0.113.5"), addr("192.0.2.1"), Transport::Tcp, 5000)
            .via_iif("eth0");
        assert!(!evaluate(&ruleset, "input", &packet).unwrap().is_accept());
    }

    #[test]
    fn test_family_mismatch_never_matches() {
        let policy = load(
            r#"{
                "cidr_sets": { "cluster": { "cluster": true, "entries": ["10.42.0.0/16"] } },
                "chains": { "input": { "clauses": [ {"kind": "cluster_cidr", "sources": "cluster"} ] } }
            }"#,
        );
        let ruleset = compile(&policy, "knfw");
        let packet = Packet::to_port(addr("fd42::1"), addr("fd00::1"), Transport::Tcp, 80);
        assert!(!evaluate(&ruleset, "input", &packet).unwrap().is_accept());
    }

    #[test]
    fn test_icmp_both_families() {
        let policy = load(r#"{ "chains": { "input": { "clauses": [ {"kind": "icmp"} ] } } }"#);
        let ruleset = compile(&policy, "knfw");
        for (s, d) in [("198.51.100.1", "192.0.2.1"), ("2001:db8::1", "2001:db8::2")] {
            let packet = Packet::new(addr(s), addr(d), L4::Icmp);
            assert!(evaluate(&ruleset, "input", &packet).unwrap().is_accept());
        }
    }

    #[test]
    fn test_masquerade_respects_excluded_interfaces() {
        let policy = load(
            r#"{
                "cidr_sets": { "cluster": { "cluster": true, "entries": ["10.42.0.0/16"] } },
                "interface_patterns": { "cni": ["cni0", "veth*"] },
                "nat": [ { "source": "cluster", "exclude_interfaces": "cni" } ]
            }"#,
        );
        let ruleset = compile(&policy, "knfw");
        let outbound = Packet::to_port(addr("10.42.1.5"), addr("198.51.100.7"), Transport::Tcp, 443);

        let decision = evaluate(&ruleset, "postrouting", &outbound.clone().via_oif("eth0")).unwrap();
        assert_eq!(decision.verdict, Verdict::Masquerade);

        let decision = evaluate(&ruleset, "postrouting", &outbound.via_oif("veth12ab")).unwrap();
        assert_eq!(decision.verdict, Verdict::Accept);
        assert_eq!(decision.rule_index, None);
    }

    #[test]
    fn test_missing_chain() {
        let ruleset = compile(&load("{}"), "knfw");
        let packet = Packet::new(addr("10.0.0.1"), addr("10.0.0.2"), L4::Icmp);
        assert!(evaluate(&ruleset, "postrouting", &packet).is_none());
    }
}
