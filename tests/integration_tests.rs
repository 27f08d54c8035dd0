//! Integration tests for knfw
//!
//! End-to-end apply, verify and rollback flows against the in-memory
//! nftables emulator, so no privileges are required:
//! ```bash
//! cargo test --test integration_tests
//! ```
//!
//! Each test gets its own state directory (snapshots, generation, audit log
//! and host lock) in a tempdir.

#![allow(clippy::uninlined_format_args)]

use knfw::audit::{AuditLog, EventType};
use knfw::core::backend::{MemoryBackend, NftBackend};
use knfw::core::diagnostics::{Diagnostics, FindingKind, ProcHost};
use knfw::core::enforce::Applier;
use knfw::core::error::{Error, SnapshotError};
use knfw::core::eval::{Packet, evaluate};
use knfw::core::policy::{Policy, Transport};
use knfw::core::ruleset::RuleSet;
use knfw::compile;
use std::net::IpAddr;
use std::path::Path;

/// Control-plane node with cluster networks and the "control-plane" port set
const SCENARIO: &str = r#"{
    "role": "control-plane",
    "cidr_sets": {
        "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16", "10.43.0.0/16"] }
    },
    "port_sets": {
        "control-plane": {
            "control_plane": true,
            "must_remain_reachable": true,
            "entries": [ {"protocol": "tcp", "port": 6443}, {"protocol": "tcp", "port": 10250} ]
        }
    },
    "chains": {
        "input": { "clauses": [
            {"kind": "loopback"},
            {"kind": "established"},
            {"kind": "control_plane", "ports": "control-plane"}
        ] }
    }
}"#;

/// Scenario plus public HTTPS
const WITH_HTTPS: &str = r#"{
    "role": "control-plane",
    "cidr_sets": {
        "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16", "10.43.0.0/16"] }
    },
    "port_sets": {
        "control-plane": {
            "control_plane": true,
            "must_remain_reachable": true,
            "entries": [ {"protocol": "tcp", "port": 6443}, {"protocol": "tcp", "port": 10250} ]
        },
        "web": { "entries": [ {"protocol": "tcp", "port": 443} ] }
    },
    "chains": {
        "input": { "clauses": [
            {"kind": "control_plane", "ports": "control-plane"},
            {"kind": "service", "ports": "web", "comment": "https"}
        ] }
    }
}"#;

/// Control-plane role whose control-plane set is empty
const EMPTY_CONTROL_PLANE: &str = r#"{
    "role": "control-plane",
    "cidr_sets": { "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16"] } },
    "port_sets": { "control-plane": { "control_plane": true, "must_remain_reachable": true, "entries": [] } },
    "chains": { "input": { "clauses": [ {"kind": "control_plane", "ports": "control-plane"} ] } }
}"#;

/// Control-plane set without the kubelet port
const MISSING_KUBELET: &str = r#"{
    "role": "control-plane",
    "cidr_sets": { "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16"] } },
    "port_sets": {
        "control-plane": { "control_plane": true, "entries": [ {"protocol": "tcp", "port": 6443} ] }
    },
    "chains": { "input": { "clauses": [ {"kind": "control_plane", "ports": "control-plane"} ] } }
}"#;

/// Cluster-wide accept in input and forward, with an empty control-plane set
const CLUSTER_WIDE_EMPTY_CONTROL_PLANE: &str = r#"{
    "role": "control-plane",
    "cidr_sets": {
        "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16", "10.43.0.0/16"] }
    },
    "port_sets": { "control-plane": { "control_plane": true, "must_remain_reachable": true, "entries": [] } },
    "chains": {
        "input": { "clauses": [
            {"kind": "loopback"},
            {"kind": "established"},
            {"kind": "control_plane", "ports": "control-plane"},
            {"kind": "cluster_cidr", "sources": "cluster_networks"}
        ] },
        "forward": { "clauses": [ {"kind": "cluster_cidr", "sources": "cluster_networks"} ] }
    }
}"#;

/// Scenario plus a VXLAN overlay clause shadowed by an admin drop
const DROPPED_OVERLAY: &str = r#"{
    "role": "control-plane",
    "cidr_sets": {
        "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16", "10.43.0.0/16"] }
    },
    "port_sets": {
        "control-plane": {
            "control_plane": true,
            "must_remain_reachable": true,
            "entries": [ {"protocol": "tcp", "port": 6443}, {"protocol": "tcp", "port": 10250} ]
        },
        "vxlan": { "entries": [ {"protocol": "udp", "port": 8472} ] }
    },
    "chains": {
        "input": { "clauses": [
            {"kind": "admin", "action": "drop", "ports": "vxlan"},
            {"kind": "control_plane", "ports": "control-plane"},
            {"kind": "overlay", "ports": "vxlan"}
        ] }
    }
}"#;

fn load(doc: &str) -> Policy {
    Policy::from_json_str(doc, false).unwrap().policy
}

fn applier(backend: &MemoryBackend, state_dir: &Path) -> Applier<MemoryBackend> {
    Applier::new(backend.clone(), state_dir)
}

async fn apply(applier: &Applier<MemoryBackend>, doc: &str) -> knfw::Result<u64> {
    let policy = load(doc);
    let ruleset = compile(&policy, applier.table());
    applier.apply(&policy, ruleset).await.map(|o| o.generation)
}

async fn live(backend: &MemoryBackend) -> Option<RuleSet> {
    backend
        .list_table("knfw")
        .await
        .unwrap()
        .map(|listing| RuleSet::from_nftables_json(&listing, "knfw").unwrap())
}

#[test]
fn test_compilation_is_deterministic() {
    let a = compile(&load(SCENARIO), "knfw");
    let b = compile(&load(SCENARIO), "knfw");

    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(
        serde_json::to_string(&a.to_nftables_json()).unwrap(),
        serde_json::to_string(&b.to_nftables_json()).unwrap()
    );
}

#[test]
fn test_control_plane_allow_precedes_default_drop() {
    let ruleset = compile(&load(SCENARIO), "knfw");
    let outsider: IpAddr = "203.0.113.5".parse().unwrap();
    let node: IpAddr = "198.51.100.1".parse().unwrap();

    for port in [6443, 10250] {
        let packet = Packet::to_port(outsider, node, Transport::Tcp, port).via_iif("eth0");
        let decision = evaluate(&ruleset, "input", &packet).unwrap();
        assert!(decision.is_accept(), "tcp/{}: {}", port, decision.describe());
        assert_eq!(decision.comment.as_deref(), Some("control_plane"));
    }

    let ssh = Packet::to_port(outsider, node, Transport::Tcp, 22).via_iif("eth0");
    let decision = evaluate(&ruleset, "input", &ssh).unwrap();
    assert!(!decision.is_accept());
    assert_eq!(decision.rule_index, None, "dropped by the chain policy");
}

#[test]
fn test_cluster_allow_wins_over_narrower_deny() {
    let policy = load(
        r#"{
        "cidr_sets": {
            "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16"] },
            "quarantine": { "entries": ["10.42.5.0/24"] }
        },
        "port_sets": { "ssh": { "entries": [ {"protocol": "tcp", "port": 22} ] } },
        "chains": { "input": { "clauses": [
            {"kind": "service", "action": "drop", "sources": "quarantine", "ports": "ssh"},
            {"kind": "cluster_cidr", "sources": "cluster_networks"}
        ] } }
    }"#,
    );
    let ruleset = compile(&policy, "knfw");
    let node: IpAddr = "198.51.100.1".parse().unwrap();

    let quarantined: IpAddr = "10.42.5.9".parse().unwrap();
    let packet = Packet::to_port(quarantined, node, Transport::Tcp, 22);
    let decision = evaluate(&ruleset, "input", &packet).unwrap();
    assert!(decision.is_accept(), "{}", decision.describe());
    assert_eq!(decision.comment.as_deref(), Some("cluster_cidr"));

    let outsider: IpAddr = "203.0.113.5".parse().unwrap();
    let packet = Packet::to_port(outsider, node, Transport::Tcp, 22);
    assert!(!evaluate(&ruleset, "input", &packet).unwrap().is_accept());
}

#[test]
fn test_empty_input_compiles_fail_closed() {
    let ruleset = compile(&load(r#"{"chains": {"input": {"clauses": []}}}"#), "knfw");
    let input = ruleset.chain("input").unwrap();

    let comments: Vec<&str> = input
        .rules
        .iter()
        .filter_map(|r| r.comment.as_deref())
        .collect();
    assert_eq!(comments, vec!["loopback", "invalid", "established"]);
    assert_eq!(input.policy.to_string(), "drop");
}

#[tokio::test]
async fn test_scenario_apply_passes_verification() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    let policy = load(SCENARIO);
    let outcome = applier
        .apply(&policy, compile(&policy, "knfw"))
        .await
        .unwrap();

    assert_eq!(outcome.generation, 1);
    assert!(outcome.checks.iter().all(|c| c.passed));
    for port in ["tcp/6443", "tcp/10250"] {
        assert!(
            outcome
                .checks
                .iter()
                .any(|c| c.name.starts_with(&format!("reachability {}", port))),
            "no check for {}",
            port
        );
    }

    let live = live(&backend).await.unwrap();
    assert_eq!(live.generation, Some(1));
    assert_eq!(live.fingerprint, outcome.fingerprint);
}

#[tokio::test]
async fn test_reapply_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    assert_eq!(apply(&applier, SCENARIO).await.unwrap(), 1);
    let first = live(&backend).await.unwrap();

    let policy = load(SCENARIO);
    let outcome = applier
        .apply(&policy, compile(&policy, "knfw"))
        .await
        .unwrap();
    assert!(outcome.unchanged);
    assert_eq!(outcome.generation, 1);

    let second = live(&backend).await.unwrap();
    assert_eq!(second.rule_count(), first.rule_count());
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_generation_increments_on_change() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    assert_eq!(apply(&applier, SCENARIO).await.unwrap(), 1);
    assert_eq!(apply(&applier, WITH_HTTPS).await.unwrap(), 2);
    assert_eq!(apply(&applier, SCENARIO).await.unwrap(), 3);
    assert_eq!(applier.log().read_generation().unwrap(), 3);
}

#[tokio::test]
async fn test_empty_control_plane_set_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    let before = applier.capture().await.unwrap();

    let err = apply(&applier, EMPTY_CONTROL_PLANE).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    let Error::VerificationFailed {
        generation,
        ref failures,
    } = err
    else {
        panic!("expected VerificationFailed, got {err:?}");
    };
    assert_eq!(generation, 2);
    assert!(
        failures
            .iter()
            .any(|f| f.name.starts_with("reachability tcp/6443"))
    );

    let after = applier.capture().await.unwrap();
    assert_eq!(after.normalized(), before.normalized());
    assert_eq!(after.generation, Some(1));
    assert_eq!(applier.log().read_generation().unwrap(), 1);
}

#[tokio::test]
async fn test_cluster_wide_accept_does_not_mask_empty_control_plane() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    let before = applier.capture().await.unwrap();

    let err = apply(&applier, CLUSTER_WIDE_EMPTY_CONTROL_PLANE).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    let Error::VerificationFailed { ref failures, .. } = err else {
        panic!("expected VerificationFailed, got {err:?}");
    };
    for port in ["tcp/6443", "tcp/10250"] {
        let failure = failures
            .iter()
            .find(|f| f.name.starts_with(&format!("reachability {} ", port)))
            .unwrap_or_else(|| panic!("no failure for {}: {:?}", port, failures));
        assert!(failure.observed.contains("from 192.0.2.10"), "{}", failure);
    }

    let after = applier.capture().await.unwrap();
    assert_eq!(after.normalized(), before.normalized());
}

#[tokio::test]
async fn test_dropped_overlay_port_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    let err = apply(&applier, DROPPED_OVERLAY).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    let Error::VerificationFailed { ref failures, .. } = err else {
        panic!("expected VerificationFailed, got {err:?}");
    };
    assert_eq!(failures.len(), 1, "{:?}", failures);
    assert_eq!(failures[0].name, "reachability udp/8472 (overlay)");
    assert!(failures[0].observed.contains("(admin)"), "{}", failures[0]);
    assert_eq!(live(&backend).await.unwrap().generation, Some(1));
}

#[tokio::test]
async fn test_missing_kubelet_port_restores_absent_table() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    let err = apply(&applier, MISSING_KUBELET).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.recovery_instructions().is_none());

    // Both the apply and the restore were atomic batches
    assert_eq!(backend.writes(), 2);
    assert!(live(&backend).await.is_none());
    assert_eq!(applier.log().read_generation().unwrap(), 0);
}

#[tokio::test]
async fn test_empty_policy_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    let err = apply(&applier, "{}").await.unwrap_err();
    assert!(matches!(err, Error::VerificationFailed { .. }));
    assert!(live(&backend).await.is_none());
}

#[tokio::test]
async fn test_snapshot_restore_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    let captured = applier.capture().await.unwrap();

    apply(&applier, WITH_HTTPS).await.unwrap();
    assert_ne!(applier.capture().await.unwrap().normalized(), captured.normalized());

    let record = applier.restore_snapshot(&captured).await.unwrap();
    assert!(record.path.exists());

    let restored = applier.capture().await.unwrap();
    assert_eq!(restored.normalized(), captured.normalized());
    assert_eq!(restored.generation, Some(1));
    assert_eq!(restored.fingerprint, captured.fingerprint);
}

#[tokio::test]
async fn test_rollback_restores_newest_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    let scenario = compile(&load(SCENARIO), "knfw").fingerprint;
    apply(&applier, WITH_HTTPS).await.unwrap();

    let record = applier.rollback(None).await.unwrap();
    assert_eq!(record.snapshot.generation, Some(1));
    assert_eq!(live(&backend).await.unwrap().fingerprint, scenario);

    // The oldest snapshot holds the state before the first apply
    let oldest = applier.log().list().unwrap().last().unwrap().name.clone();
    applier.rollback(Some(&oldest)).await.unwrap();
    assert!(live(&backend).await.is_none());
}

#[tokio::test]
async fn test_retention_keeps_five_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    for i in 0..7 {
        let doc = if i % 2 == 0 { SCENARIO } else { WITH_HTTPS };
        apply(&applier, doc).await.unwrap();
    }

    let entries = applier.log().list().unwrap();
    assert_eq!(entries.len(), 5);
    let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![7, 6, 5, 4, 3]);
}

#[tokio::test]
async fn test_tampered_snapshot_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    let policy = load(WITH_HTTPS);
    let outcome = applier
        .apply(&policy, compile(&policy, "knfw"))
        .await
        .unwrap();

    let path = &outcome.snapshot.path;
    let tampered = std::fs::read_to_string(path)
        .unwrap()
        .replace("\"generation\": 1", "\"generation\": 9");
    std::fs::write(path, tampered).unwrap();

    let err = applier.rollback(None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Snapshot(SnapshotError::ChecksumMismatch { .. })
    ));
    assert_eq!(err.exit_code(), 4);

    // The live table was not touched
    assert_eq!(live(&backend).await.unwrap().fingerprint, outcome.fingerprint);
}

#[tokio::test]
async fn test_concurrent_applies_are_serialised() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let first = applier(&backend, dir.path());
    let second = applier(&backend, dir.path());

    let (a, b) = tokio::join!(apply(&first, SCENARIO), apply(&second, WITH_HTTPS));
    let mut generations = vec![a.unwrap(), b.unwrap()];
    generations.sort_unstable();
    assert_eq!(generations, vec![1, 2]);

    // One snapshot saw the empty host, the other saw generation 1
    let log = first.log();
    let mut seen: Vec<Option<u64>> = log
        .list()
        .unwrap()
        .iter()
        .map(|e| log.load(&e.name).unwrap().snapshot.generation)
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![None, Some(1)]);
    assert_eq!(live(&backend).await.unwrap().generation, Some(2));
}

#[tokio::test]
async fn test_failed_restore_requires_manual_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());
    backend.fail_writes_after(1);

    let err = apply(&applier, MISSING_KUBELET).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    let Error::Restore {
        ref snapshot,
        ref failures,
        ..
    } = err
    else {
        panic!("expected Restore, got {err:?}");
    };
    assert!(snapshot.exists());
    assert!(
        failures
            .iter()
            .any(|f| f.name.starts_with("reachability tcp/10250")),
        "{:?}",
        failures
    );

    let instructions = err.recovery_instructions().unwrap();
    assert!(instructions.contains("nft list table inet knfw"));
    assert!(instructions.contains("knfw rollback"));
    assert!(instructions.contains("--batch | nft -j -f -"));

    let events = AuditLog::new(dir.path()).read_recent(10).await.unwrap();
    let kinds: Vec<(EventType, bool)> = events.iter().map(|e| (e.event_type, e.success)).collect();
    assert!(kinds.contains(&(EventType::VerificationFailed, false)));
    assert!(kinds.contains(&(EventType::RestoreSnapshot, false)));
}

#[tokio::test]
async fn test_recovery_instructions_name_configured_table() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path()).with_table("edge_fw");
    backend.fail_writes_after(1);

    let err = apply(&applier, MISSING_KUBELET).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    let instructions = err.recovery_instructions().unwrap();
    assert!(instructions.contains("nft list table inet edge_fw"), "{}", instructions);
    assert!(!instructions.contains("inet knfw"));
}

#[tokio::test]
async fn test_hand_edited_table_is_not_taken_as_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());
    assert_eq!(apply(&applier, SCENARIO).await.unwrap(), 1);

    // Drop the control-plane rule but keep the generation 1 stamp
    let mut edited = compile(&load(SCENARIO), "knfw").with_generation(1);
    for chain in edited.chains.iter_mut().filter(|c| c.name == "input") {
        chain
            .rules
            .retain(|r| r.comment.as_deref() != Some("control_plane"));
    }
    backend.write(&edited.to_nftables_json()).await.unwrap();
    let drifted = live(&backend).await.unwrap();
    assert!(drifted.has_drifted());
    assert_eq!(drifted.generation, Some(1));

    let policy = load(SCENARIO);
    let outcome = applier
        .apply(&policy, compile(&policy, "knfw"))
        .await
        .unwrap();
    assert!(!outcome.unchanged);
    assert_eq!(outcome.generation, 2);
    assert!(!live(&backend).await.unwrap().has_drifted());
}

#[tokio::test]
async fn test_unreachable_subsystem_aborts_before_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    backend.set_unreachable(true);
    let applier = applier(&backend, dir.path());

    let err = apply(&applier, SCENARIO).await.unwrap_err();
    assert!(matches!(err, Error::Capture(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(backend.writes(), 0);
    assert!(applier.log().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_audit_trail_records_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let applier = applier(&backend, dir.path());

    apply(&applier, SCENARIO).await.unwrap();
    apply(&applier, MISSING_KUBELET).await.unwrap_err();

    let events = AuditLog::new(dir.path()).read_recent(10).await.unwrap();
    let kinds: Vec<(EventType, bool)> = events.iter().map(|e| (e.event_type, e.success)).collect();
    assert!(kinds.contains(&(EventType::Apply, true)));
    assert!(kinds.contains(&(EventType::RestoreSnapshot, true)));
    assert!(kinds.contains(&(EventType::VerificationFailed, false)));
}

#[tokio::test]
async fn test_diagnostics_ranks_root_causes() {
    // kubelet is denied by an earlier admin clause; nf_conntrack is missing
    const SHADOWED: &str = r#"{
        "role": "control-plane",
        "cidr_sets": { "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16"] } },
        "port_sets": {
            "control-plane": {
                "control_plane": true,
                "must_remain_reachable": true,
                "entries": [ {"protocol": "tcp", "port": 6443}, {"protocol": "tcp", "port": 10250} ]
            },
            "blocked": { "entries": [ {"protocol": "tcp", "port": 10250} ] }
        },
        "chains": { "input": { "clauses": [
            {"kind": "control_plane", "ports": "control-plane"},
            {"kind": "admin", "action": "drop", "ports": "blocked"}
        ] } }
    }"#;

    let root = tempfile::tempdir().unwrap();
    let r = root.path();
    std::fs::create_dir_all(r.join("proc/net")).unwrap();
    std::fs::write(r.join("proc/modules"), "nf_tables 356352 0 - Live 0x0\n").unwrap();
    std::fs::write(
        r.join("proc/net/tcp"),
        "  sl  local_address rem_address   st\n   0: 00000000:192B 00000000:0000 0A\n",
    )
    .unwrap();
    let host = ProcHost::with_root(r);

    let policy = load(SHADOWED);
    let backend = MemoryBackend::new();
    backend
        .write(&compile(&policy, "knfw").with_generation(3).to_nftables_json())
        .await
        .unwrap();

    let report = Diagnostics::new(&backend, &host, "knfw")
        .diagnose(&policy)
        .await
        .unwrap();
    assert!(report.installed);
    assert_eq!(report.generation, Some(3));

    let violations: Vec<(FindingKind, &str)> = report
        .violations()
        .map(|f| (f.kind, f.subject.as_str()))
        .collect();
    assert_eq!(violations.len(), 2, "{:?}", violations);
    assert_eq!(violations[0], (FindingKind::MissingModule, "nf_conntrack"));
    assert_eq!(violations[1].0, FindingKind::ShadowedByDeny);
    assert!(violations[1].1.starts_with("tcp/10250"));

    // Read-only: nothing besides the seeding write happened
    assert_eq!(backend.writes(), 1);
}
