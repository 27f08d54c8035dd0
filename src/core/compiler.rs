//! Policy → compiled rule set
//!
//! Compilation is a pure, total function. All reference checks happened when
//! the policy was loaded, so a missing set here simply yields no rule.
//!
//! Emission order inside every filter chain is fixed:
//!
//! 1. fast path (`iifname lo accept` on input, `ct state invalid drop`,
//!    `ct state established,related accept`)
//! 2. clauses in [`ClauseKind`] order, source order within a kind
//! 3. the chain's default policy
//!
//! Packets are evaluated first-match-wins, so this order is part of the
//! contract.

use crate::core::policy::{Action, ChainName, ChainPolicy, Clause, ClauseKind, Policy, Transport};
use crate::core::ruleset::{
    AddrTarget, Chain, ChainType, CtState, Direction, Family, Hook, L4Proto, Match, NamedSet,
    PortTarget, Rule, RuleSet, SetElement, SetKind, Verdict,
};
use crate::validators::nft_identifier;
use strum::IntoEnumIterator;

/// Base chain priority of the filter chains
pub const FILTER_PRIORITY: i32 = 0;

/// srcnat
pub const NAT_PRIORITY: i32 = 100;

pub const NAT_CHAIN: &str = "postrouting";

/// Name of the compiled set holding the `family` half of CIDR set `name`
pub fn cidr_set_name(name: &str, family: Family) -> String {
    format!("cidr_{}_{}", nft_identifier(name), family.suffix())
}

/// Name of the compiled set holding the `protocol` half of port set `name`
pub fn port_set_name(name: &str, protocol: Transport) -> String {
    format!("port_{}_{}", nft_identifier(name), protocol.as_str())
}

/// Compiles `policy` into the complete content of table `inet <table>`.
pub fn compile(policy: &Policy, table: &str) -> RuleSet {
    let compiler = Compiler { policy };

    let sets = compiler.named_sets();

    let mut chains: Vec<Chain> = ChainName::iter()
        .map(|name| compiler.filter_chain(policy.chain(name)))
        .collect();

    if !policy.nat.is_empty() {
        chains.push(compiler.nat_chain());
    }

    let ruleset = RuleSet::new(table, sets, chains);
    tracing::debug!(
        sets = ruleset.sets.len(),
        rules = ruleset.rule_count(),
        fingerprint = %ruleset.fingerprint,
        "Compiled policy"
    );
    ruleset
}

struct Compiler<'a> {
    policy: &'a Policy,
}

impl Compiler<'_> {
    fn named_sets(&self) -> Vec<NamedSet> {
        let mut sets = Vec::new();

        for (name, cidr) in &self.policy.cidr_sets {
            for family in Family::iter() {
                let elements: Vec<SetElement> = match family {
                    Family::V4 => cidr.v4().copied().map(SetElement::Prefix).collect(),
                    Family::V6 => cidr.v6().copied().map(SetElement::Prefix).collect(),
                };
                if elements.is_empty() {
                    continue;
                }
                let kind = match family {
                    Family::V4 => SetKind::Ipv4Addr,
                    Family::V6 => SetKind::Ipv6Addr,
                };
                sets.push(NamedSet {
                    name: cidr_set_name(name, family),
                    kind,
                    elements,
                });
            }
        }

        for (name, ports) in &self.policy.port_sets {
            for protocol in Transport::iter() {
                let elements: Vec<SetElement> = ports
                    .protocol_entries(protocol)
                    .map(|e| {
                        if e.range.start == e.range.end {
                            SetElement::Port(e.range.start)
                        } else {
                            SetElement::PortRange(e.range.start, e.range.end)
                        }
                    })
                    .collect();
                if elements.is_empty() {
                    continue;
                }
                sets.push(NamedSet {
                    name: port_set_name(name, protocol),
                    kind: SetKind::InetService,
                    elements,
                });
            }
        }

        sets
    }

    /// Families in which CIDR set `name` has entries
    fn families_of(&self, name: &str) -> Vec<Family> {
        let Some(set) = self.policy.cidr_sets.get(name) else {
            return Vec::new();
        };
        Family::iter()
            .filter(|family| match family {
                Family::V4 => set.v4().next().is_some(),
                Family::V6 => set.v6().next().is_some(),
            })
            .collect()
    }

    /// Transports in which port set `name` has entries
    fn transports_of(&self, name: &str) -> Vec<Transport> {
        let Some(set) = self.policy.port_sets.get(name) else {
            return Vec::new();
        };
        Transport::iter()
            .filter(|t| set.protocol_entries(*t).next().is_some())
            .collect()
    }

    fn filter_chain(&self, chain: &ChainPolicy) -> Chain {
        let hook = match chain.chain {
            ChainName::Input => Hook::Input,
            ChainName::Forward => Hook::Forward,
            ChainName::Output => Hook::Output,
        };

        let mut rules = fast_path(chain.chain);

        let mut clauses: Vec<&Clause> = chain
            .clauses
            .iter()
            .filter(|c| !c.kind.is_fast_path())
            .collect();
        // Stable: clauses of one kind keep source order
        clauses.sort_by_key(|c| c.kind);

        for clause in clauses {
            rules.extend(self.expand_clause(chain.chain, clause));
        }

        Chain {
            name: chain.chain.as_str().to_string(),
            chain_type: ChainType::Filter,
            hook,
            prio: FILTER_PRIORITY,
            policy: chain.policy,
            rules,
        }
    }

    /// Expands one clause into the cross product of address directions,
    /// families, transports and interface patterns.
    fn expand_clause(&self, chain: ChainName, clause: &Clause) -> Vec<Rule> {
        let directions: &[Direction] = match (chain, clause.kind) {
            (ChainName::Forward, ClauseKind::ClusterCidr) => {
                &[Direction::Source, Direction::Destination]
            }
            (ChainName::Output, _) => &[Direction::Destination],
            _ => &[Direction::Source],
        };

        let addr_opts: Vec<Option<(Family, String)>> = match clause.sources {
            Some(ref name) => self
                .families_of(name)
                .into_iter()
                .map(|family| Some((family, cidr_set_name(name, family))))
                .collect(),
            None => vec![None],
        };

        let port_opts: Vec<Option<Match>> = match clause.ports {
            Some(ref name) => self
                .transports_of(name)
                .into_iter()
                .map(|protocol| {
                    Some(Match::Dport {
                        protocol,
                        target: PortTarget::Set(port_set_name(name, protocol)),
                    })
                })
                .collect(),
            None => vec![None],
        };

        let iface_opts: Vec<Option<Match>> = match clause.interfaces {
            Some(ref name) => {
                let patterns = self
                    .policy
                    .interface_patterns
                    .get(name)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                interface_matches(chain, clause.kind, patterns)
            }
            None => vec![None],
        };

        let verdict = Verdict::from(clause.action);
        let comment = Some(
            clause
                .comment
                .clone()
                .unwrap_or_else(|| clause.kind.to_string()),
        );

        let mut rules = Vec::new();
        for &direction in directions {
            for addr in &addr_opts {
                let proto_opts: Vec<Option<Match>> = if clause.kind == ClauseKind::Icmp {
                    vec![Some(Match::L4Proto(icmp_protocols(addr.as_ref().map(|(f, _)| *f))))]
                } else {
                    port_opts.clone()
                };

                for proto in &proto_opts {
                    for iface in &iface_opts {
                        let mut matches = Vec::with_capacity(3);
                        if let Some(iface) = iface {
                            matches.push(iface.clone());
                        }
                        if let Some((family, set)) = addr {
                            matches.push(Match::Addr {
                                family: *family,
                                direction,
                                target: AddrTarget::Set(set.clone()),
                            });
                        }
                        if let Some(proto) = proto {
                            matches.push(proto.clone());
                        }
                        rules.push(Rule::new(matches, verdict).with_comment(comment.clone()));
                    }
                }
            }
        }
        rules
    }

    fn nat_chain(&self) -> Chain {
        let mut rules = Vec::new();

        for nat in &self.policy.nat {
            let excluded = nat
                .exclude_interfaces
                .as_ref()
                .and_then(|name| self.policy.interface_patterns.get(name))
                .map(Vec::as_slice)
                .unwrap_or_default();

            for family in self.families_of(&nat.source) {
                let mut matches = vec![Match::Addr {
                    family,
                    direction: Direction::Source,
                    target: AddrTarget::Set(cidr_set_name(&nat.source, family)),
                }];
                matches.extend(excluded.iter().map(|pattern| Match::OifName {
                    pattern: pattern.clone(),
                    negated: true,
                }));
                rules.push(
                    Rule::new(matches, Verdict::Masquerade)
                        .with_comment(Some(format!("{} {}", nat.action, nat.source))),
                );
            }
        }

        Chain {
            name: NAT_CHAIN.to_string(),
            chain_type: ChainType::Nat,
            hook: Hook::Postrouting,
            prio: NAT_PRIORITY,
            policy: Action::Accept,
            rules,
        }
    }
}

fn fast_path(chain: ChainName) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(3);
    if chain == ChainName::Input {
        rules.push(
            Rule::new(
                vec![Match::IifName {
                    pattern: "lo".into(),
                    negated: false,
                }],
                Verdict::Accept,
            )
            .with_comment(Some("loopback".into())),
        );
    }
    rules.push(
        Rule::new(vec![Match::CtState(vec![CtState::Invalid])], Verdict::Drop)
            .with_comment(Some("invalid".into())),
    );
    rules.push(
        Rule::new(
            vec![Match::CtState(vec![CtState::Established, CtState::Related])],
            Verdict::Accept,
        )
        .with_comment(Some("established".into())),
    );
    rules
}

fn icmp_protocols(family: Option<Family>) -> Vec<L4Proto> {
    match family {
        Some(Family::V4) => vec![L4Proto::Icmp],
        Some(Family::V6) => vec![L4Proto::Icmpv6],
        None => vec![L4Proto::Icmp, L4Proto::Icmpv6],
    }
}

fn interface_matches(chain: ChainName, kind: ClauseKind, patterns: &[String]) -> Vec<Option<Match>> {
    let iif = |p: &String| {
        Some(Match::IifName {
            pattern: p.clone(),
            negated: false,
        })
    };
    let oif = |p: &String| {
        Some(Match::OifName {
            pattern: p.clone(),
            negated: false,
        })
    };

    match (chain, kind) {
        (ChainName::Forward, ClauseKind::Interface) => {
            patterns.iter().map(iif).chain(patterns.iter().map(oif)).collect()
        }
        (ChainName::Output, _) => patterns.iter().map(oif).collect(),
        _ => patterns.iter().map(iif).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{SCENARIO_POLICY, load};

    fn rule_texts(ruleset: &RuleSet, chain: &str) -> Vec<String> {
        ruleset
            .chain(chain)
            .unwrap()
            .rules
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_scenario_order() {
        let ruleset = compile(&load(SCENARIO_POLICY), "knfw");
        assert_eq!(
            rule_texts(&ruleset, "input"),
            vec![
                "iifname \"lo\" accept comment \"loopback\"",
                "ct state invalid drop comment \"invalid\"",
                "ct state established,related accept comment \"established\"",
                "tcp dport @port_control_plane_tcp accept comment \"control_plane\"",
            ]
        );
        assert_eq!(ruleset.chain("input").unwrap().policy, Action::Drop);
        assert_eq!(ruleset.chain("output").unwrap().policy, Action::Accept);
        assert!(ruleset.chain(NAT_CHAIN).is_none());
    }

    #[test]
    fn test_named_sets_split_by_family_and_protocol() {
        let policy = load(
            r#"{
                "cidr_sets": { "cluster-net": { "cluster": true, "entries": ["10.42.0.0/16", "fd42::/48"] },
                               "empty": { "entries": [] } },
                "port_sets": { "dns": { "entries": [ {"protocol": "udp", "port": 53}, {"protocol": "tcp", "port": 53} ] } }
            }"#,
        );
        let ruleset = compile(&policy, "knfw");
        let names: Vec<&str> = ruleset.sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["cidr_cluster_net_v4", "cidr_cluster_net_v6", "port_dns_tcp", "port_dns_udp"]
        );
    }

    #[test]
    fn test_priority_order_overrides_source_order() {
        let policy = load(
            r#"{
                "cidr_sets": { "cluster": { "cluster": true, "entries": ["10.42.0.0/16"] } },
                "port_sets": {
                    "ssh": { "entries": [ {"protocol": "tcp", "port": 22} ] },
                    "nodeports": { "entries": [ {"protocol": "tcp", "port": "30000-32767"} ] }
                },
                "chains": { "input": { "clauses": [
                    {"kind": "node_port", "ports": "nodeports"},
                    {"kind": "cluster_cidr", "sources": "cluster"},
                    {"kind": "icmp"},
                    {"kind": "admin", "ports": "ssh"}
                ] } }
            }"#,
        );
        let texts = rule_texts(&compile(&policy, "knfw"), "input");
        assert_eq!(
            &texts[3..],
            &[
                "tcp dport @port_ssh_tcp accept comment \"admin\"",
                "meta l4proto { icmp, ipv6-icmp } accept comment \"icmp\"",
                "ip saddr @cidr_cluster_v4 accept comment \"cluster_cidr\"",
                "tcp dport @port_nodeports_tcp accept comment \"node_port\"",
            ]
        );
    }

    #[test]
    fn test_forward_cluster_is_bidirectional_and_interfaces_both_ways() {
        let policy = load(
            r#"{
                "cidr_sets": { "cluster": { "cluster": true, "entries": ["10.42.0.0/16"] } },
                "interface_patterns": { "cni": ["cni0", "veth*"] },
                "chains": { "forward": { "clauses": [
                    {"kind": "interface", "interfaces": "cni"},
                    {"kind": "cluster_cidr", "sources": "cluster"}
                ] } }
            }"#,
        );
        let texts = rule_texts(&compile(&policy, "knfw"), "forward");
        assert_eq!(
            &texts[2..],
            &[
                "ip saddr @cidr_cluster_v4 accept comment \"cluster_cidr\"",
                "ip daddr @cidr_cluster_v4 accept comment \"cluster_cidr\"",
                "iifname \"cni0\" accept comment \"interface\"",
                "iifname \"veth*\" accept comment \"interface\"",
                "oifname \"cni0\" accept comment \"interface\"",
                "oifname \"veth*\" accept comment \"interface\"",
            ]
        );
    }

    #[test]
    fn test_empty_referenced_set_yields_no_rule() {
        let policy = load(
            r#"{
                "cidr_sets": { "trusted": { "entries": [] } },
                "port_sets": { "cp": { "entries": [] } },
                "chains": { "input": { "clauses": [
                    {"kind": "cluster_cidr", "sources": "trusted"},
                    {"kind": "control_plane", "ports": "cp"}
                ] } }
            }"#,
        );
        let ruleset = compile(&policy, "knfw");
        assert_eq!(ruleset.chain("input").unwrap().rules.len(), 3);
        assert!(ruleset.sets.is_empty());
    }

    #[test]
    fn test_nat_chain() {
        let policy = load(
            r#"{
                "cidr_sets": { "cluster": { "cluster": true, "entries": ["10.42.0.0/16", "fd42::/48"] } },
                "interface_patterns": { "cni": ["cni0", "flannel.1"] },
                "nat": [ { "source": "cluster", "exclude_interfaces": "cni" } ]
            }"#,
        );
        let ruleset = compile(&policy, "knfw");
        let nat = ruleset.chain(NAT_CHAIN).unwrap();
        assert_eq!(nat.chain_type, ChainType::Nat);
        assert_eq!(nat.prio, NAT_PRIORITY);
        assert_eq!(nat.policy, Action::Accept);
        assert_eq!(
            rule_texts(&ruleset, NAT_CHAIN),
            vec![
                "ip saddr @cidr_cluster_v4 oifname != \"cni0\" oifname != \"flannel.1\" masquerade comment \"masquerade cluster\"",
                "ip6 saddr @cidr_cluster_v6 oifname != \"cni0\" oifname != \"flannel.1\" masquerade comment \"masquerade cluster\"",
            ]
        );
    }

    #[test]
    fn test_fail_closed_empty_input() {
        let ruleset = compile(&load("{}"), "knfw");
        let input = ruleset.chain("input").unwrap();
        assert_eq!(input.policy, Action::Drop);
        assert_eq!(input.rules.len(), 3);
        assert!(input.rules.iter().all(|r| {
            r.matches.iter().all(|m| matches!(m, Match::IifName { .. } | Match::CtState(_)))
        }));
    }

    #[test]
    fn test_output_clause_matches_destination_and_oifname() {
        let policy = load(
            r#"{
                "cidr_sets": { "dns": { "entries": ["10.43.0.10/32"] } },
                "interface_patterns": { "uplink": ["eth0"] },
                "port_sets": { "dns": { "entries": [ {"protocol": "udp", "port": 53} ] } },
                "chains": { "output": { "policy": "drop", "clauses": [
                    {"kind": "service", "sources": "dns", "ports": "dns", "interfaces": "uplink", "comment": "dns"}
                ] } }
            }"#,
        );
        let texts = rule_texts(&compile(&policy, "knfw"), "output");
        assert_eq!(
            texts[2],
            "oifname \"eth0\" ip daddr @cidr_dns_v4 udp dport @port_dns_udp accept comment \"dns\""
        );
    }
}
