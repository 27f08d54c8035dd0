#[cfg(test)]
mod property_tests {
    use crate::core::compiler::compile;
    use crate::core::eval::{Packet, evaluate};
    use crate::core::policy::{ClauseKind, Policy, Transport};
    use crate::core::ruleset::RuleSet;
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use std::net::{IpAddr, Ipv6Addr};

    const CLAUSE_KINDS: [&str; 6] = [
        "admin",
        "icmp",
        "control_plane",
        "cluster_cidr",
        "service",
        "node_port",
    ];

    prop_compose! {
        fn arb_v4_cidr()(a in 1u8..=223, b in any::<u8>(), c in any::<u8>(), prefix in 8u8..=32) -> String {
            format!("{a}.{b}.{c}.0/{prefix}")
        }
    }

    prop_compose! {
        fn arb_port_entry()(tcp in any::<bool>(), start in 1u16..=60000, width in 0u16..=100) -> (Transport, u16, u16) {
            let protocol = if tcp { Transport::Tcp } else { Transport::Udp };
            (protocol, start, start + width)
        }
    }

    prop_compose! {
        fn arb_clause()(kind in 0usize..CLAUSE_KINDS.len(), accept in any::<bool>(), scoped in any::<bool>()) -> Value {
            let kind = CLAUSE_KINDS[kind];
            let action = if accept { "accept" } else { "drop" };
            let mut clause = json!({ "kind": kind, "action": action });
            if kind == "cluster_cidr" || (scoped && kind != "node_port") {
                clause["sources"] = json!("cluster");
            }
            if kind != "icmp" && kind != "cluster_cidr" {
                clause["ports"] = json!("svc");
            }
            clause
        }
    }

    fn policy_doc(
        cidrs: &[String],
        ports: &[(Transport, u16, u16)],
        input: &[Value],
        forward: &[Value],
    ) -> String {
        let entries: Vec<Value> = ports
            .iter()
            .map(|(protocol, start, end)| {
                json!({ "protocol": protocol.as_str(), "port": format!("{start}-{end}") })
            })
            .collect();
        json!({
            "cidr_sets": { "cluster": { "cluster": true, "entries": cidrs } },
            "port_sets": { "svc": { "entries": entries } },
            "chains": {
                "input": { "clauses": input },
                "forward": { "clauses": forward }
            }
        })
        .to_string()
    }

    fn load(doc: &str) -> Policy {
        Policy::from_json_str(doc, false).unwrap().policy
    }

    prop_compose! {
        fn arb_policy_doc()(
            cidrs in prop::collection::vec(arb_v4_cidr(), 1..6),
            ports in prop::collection::vec(arb_port_entry(), 1..6),
            input in prop::collection::vec(arb_clause(), 0..8),
            forward in prop::collection::vec(arb_clause(), 0..4),
        ) -> String {
            policy_doc(&cidrs, &ports, &input, &forward)
        }
    }

    /// Comments of every rule in `chain`
    fn comments(ruleset: &RuleSet, chain: &str) -> Vec<String> {
        ruleset
            .chain(chain)
            .unwrap()
            .rules
            .iter()
            .map(|r| r.comment.clone().unwrap_or_default())
            .collect()
    }

    proptest! {
        #[test]
        fn test_compile_is_deterministic(doc in arb_policy_doc()) {
            let first = compile(&load(&doc), "knfw");
            let second = compile(&load(&doc), "knfw");

            prop_assert_eq!(&first.fingerprint, &second.fingerprint);
            prop_assert_eq!(
                first.to_nftables_json().to_string(),
                second.to_nftables_json().to_string()
            );
            prop_assert_eq!(first.to_nft_text(), second.to_nft_text());
        }

        #[test]
        fn test_fast_path_leads_every_filter_chain(doc in arb_policy_doc()) {
            let ruleset = compile(&load(&doc), "knfw");

            let input = comments(&ruleset, "input");
            prop_assert_eq!(&input[..3], &["loopback", "invalid", "established"]);
            for chain in ["forward", "output"] {
                let rules = comments(&ruleset, chain);
                prop_assert_eq!(&rules[..2], &["invalid", "established"]);
            }
        }

        #[test]
        fn test_clause_rules_follow_kind_order(doc in arb_policy_doc()) {
            let ruleset = compile(&load(&doc), "knfw");

            for (chain, skip) in [("input", 3), ("forward", 2)] {
                let kinds: Vec<ClauseKind> = comments(&ruleset, chain)[skip..]
                    .iter()
                    .map(|c| c.parse().unwrap())
                    .collect();
                prop_assert!(
                    kinds.windows(2).all(|w| w[0] <= w[1]),
                    "{} rules out of order: {:?}", chain, kinds
                );
            }
        }

        #[test]
        fn test_rule_count_independent_of_set_size(
            cidrs in prop::collection::vec(arb_v4_cidr(), 1..20),
            ports in prop::collection::vec(arb_port_entry(), 1..6),
            input in prop::collection::vec(arb_clause(), 0..8),
        ) {
            let full = compile(&load(&policy_doc(&cidrs, &ports, &input, &[])), "knfw");
            let single = compile(&load(&policy_doc(&cidrs[..1], &ports, &input, &[])), "knfw");

            prop_assert_eq!(full.rule_count(), single.rule_count());
        }

        #[test]
        fn test_batch_parses_back(doc in arb_policy_doc(), generation in 1u64..1_000_000) {
            let compiled = compile(&load(&doc), "knfw").with_generation(generation);
            let parsed = RuleSet::from_nftables_json(&compiled.to_nftables_json(), "knfw").unwrap();

            prop_assert_eq!(&parsed.fingerprint, &compiled.fingerprint);
            prop_assert_eq!(parsed, compiled);
        }

        #[test]
        fn test_unlisted_port_is_dropped(doc in arb_policy_doc(), port in 60200u16..=65535) {
            // Cluster entries are IPv4 and svc ports stay below 60101
            let ruleset = compile(&load(&doc), "knfw");
            let src = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7));
            let dst = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

            for protocol in [Transport::Tcp, Transport::Udp] {
                let decision =
                    evaluate(&ruleset, "input", &Packet::to_port(src, dst, protocol, port)).unwrap();
                prop_assert!(!decision.is_accept(), "{}", decision.describe());
                prop_assert_eq!(decision.rule_index, None);
            }
        }

        #[test]
        fn test_first_matching_clause_wins(port in 1u16..=65535, accept_first in any::<bool>()) {
            let (first, second) = if accept_first { ("accept", "drop") } else { ("drop", "accept") };
            let doc = policy_doc(
                &["10.42.0.0/16".to_string()],
                &[(Transport::Tcp, port, port)],
                &[
                    json!({ "kind": "service", "action": first, "ports": "svc" }),
                    json!({ "kind": "service", "action": second, "ports": "svc" }),
                ],
                &[],
            );
            let ruleset = compile(&load(&doc), "knfw");
            let src: IpAddr = "10.42.0.9".parse().unwrap();
            let dst: IpAddr = "10.0.0.5".parse().unwrap();

            let decision =
                evaluate(&ruleset, "input", &Packet::to_port(src, dst, Transport::Tcp, port)).unwrap();
            prop_assert_eq!(decision.is_accept(), accept_first);
            prop_assert_eq!(decision.rule_index, Some(3));
        }
    }
}

#[cfg(test)]
mod integration_tests {
    //! Checks compiled batches against the real `nft` binary.
    //!
    //! `nft --check` needs root even though nothing is committed. Without nft
    //! or without root these tests skip:
    //! ```bash
    //! sudo -E cargo test integration_tests -- --nocapture
    //! ```

    use crate::core::backend::NftBackend;
    use crate::core::compiler::compile;
    use crate::core::nft::NftCli;
    use crate::core::test_helpers::{SCENARIO_POLICY, load};

    async fn is_nft_available() -> bool {
        if !nix::unistd::getuid().is_root() {
            return false;
        }
        tokio::process::Command::new("nft")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_nft_accepts_compiled_batch() {
        if !is_nft_available().await {
            eprintln!("Skipping test: nft not available or not root");
            return;
        }

        let ruleset = compile(&load(SCENARIO_POLICY), "knfw_test").with_generation(1);
        let result = NftCli::new()
            .check(&ruleset.to_nftables_json())
            .await
            .unwrap();
        assert!(result.success, "nft rejected batch: {:?}", result.errors);
    }

    #[tokio::test]
    async fn test_nft_rejects_dangling_set_reference() {
        if !is_nft_available().await {
            eprintln!("Skipping test: nft not available or not root");
            return;
        }

        let mut ruleset = compile(&load(SCENARIO_POLICY), "knfw_test");
        ruleset.sets.clear();
        let result = NftCli::new()
            .check(&ruleset.to_nftables_json())
            .await
            .unwrap();
        assert!(!result.success);
    }
}
