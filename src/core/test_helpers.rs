//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::policy::Policy;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("KNFW_TEST_NO_ELEVATION");
///     std::env::set_var("KNFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("KNFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Control-plane node: cluster networks, the "control-plane" port set, and an
/// input chain allowing loopback, established and control-plane traffic.
pub const SCENARIO_POLICY: &str = r#"{
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

/// Parses a policy document in non-strict mode, panicking on errors.
pub fn load(doc: &str) -> Policy {
    Policy::from_json_str(doc, false)
        .expect("test policy must load")
        .policy
}
