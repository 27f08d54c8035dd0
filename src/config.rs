//! Engine configuration
//!
//! Looked up in order: `--config FILE`, `<config_dir>/config.json`, built-in
//! defaults. `KNFW_STATE_DIR` overrides the state directory afterwards.
//!
//! ```json
//! {
//!   "table": "knfw",
//!   "snapshot_retention": 5,
//!   "probe_timeout_secs": 3,
//!   "probe": { "interface": "ens3", "socket_address": "10.0.0.5", "health_check_port": 10256 },
//!   "extra_required_ports": ["tcp/9345", "udp/8472"]
//! }
//! ```

use crate::core::diagnostics::ProcHost;
use crate::core::enforce::{DEFAULT_TABLE, LOCK_FILE};
use crate::core::error::{Error, Result};
use crate::core::policy::{PortEntry, Transport};
use crate::core::snapshot::DEFAULT_RETENTION;
use crate::core::verify::{DEFAULT_PROBE_INTERFACE, SERVICE_PROXY_HEALTH_PORT, Verifier};
use crate::utils::{default_state_dir, get_config_dir};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on the per-check probe timeout
pub const MAX_PROBE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// External source of synthetic packets (default: 192.0.2.10); the first
    /// cluster host is always probed as well
    #[serde(default)]
    pub source: Option<IpAddr>,
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Enables real TCP connect probes against this address
    #[serde(default)]
    pub socket_address: Option<IpAddr>,
    /// Service-proxy health-check port, required when node ports are open
    #[serde(default = "default_health_check_port")]
    pub health_check_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            source: None,
            interface: default_interface(),
            socket_address: None,
            health_check_port: default_health_check_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub lock_path: Option<PathBuf>,
    #[serde(default = "default_retention")]
    pub snapshot_retention: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Treat policy lints as errors
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// `proto/port` endpoints verified in addition to the role's built-ins
    #[serde(default)]
    pub extra_required_ports: Vec<String>,
    /// Alternative root for `/proc` and `/sys` reads (diagnostics)
    #[serde(default)]
    pub host_root: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            table: default_table(),
            lock_path: None,
            snapshot_retention: DEFAULT_RETENTION,
            probe_timeout_secs: default_probe_timeout(),
            strict: false,
            probe: ProbeConfig::default(),
            extra_required_ports: Vec::new(),
            host_root: None,
        }
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_interface() -> String {
    DEFAULT_PROBE_INTERFACE.to_string()
}

fn default_health_check_port() -> u16 {
    SERVICE_PROXY_HEALTH_PORT
}

/// Parses `tcp/9345` or `udp/30000-32767`.
pub fn parse_port_entry(text: &str) -> std::result::Result<PortEntry, String> {
    let (protocol, ports) = text
        .split_once('/')
        .ok_or_else(|| format!("'{text}' is not of the form proto/port"))?;
    let protocol: Transport = protocol
        .parse()
        .map_err(|_| format!("unknown protocol '{protocol}' (expected tcp or udp)"))?;
    let (start, end) = crate::validators::parse_port_spec(ports)?;
    Ok(PortEntry::new(protocol, start, end))
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::validation("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        crate::validators::validate_set_name(&self.table)
            .map_err(|e| Error::validation("config.table", e))?;
        if self.probe_timeout_secs == 0 || self.probe_timeout_secs > MAX_PROBE_TIMEOUT_SECS {
            return Err(Error::validation(
                "config.probe_timeout_secs",
                format!("must be between 1 and {MAX_PROBE_TIMEOUT_SECS}"),
            ));
        }
        crate::validators::validate_interface_pattern(&self.probe.interface)
            .map_err(|e| Error::validation("config.probe.interface", e))?;
        self.extra_ports()?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("KNFW_STATE_DIR")
            && !dir.is_empty()
        {
            debug!("State directory overridden by KNFW_STATE_DIR: {dir}");
            self.state_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join(LOCK_FILE))
    }

    pub fn extra_ports(&self) -> Result<Vec<PortEntry>> {
        self.extra_required_ports
            .iter()
            .enumerate()
            .map(|(i, text)| {
                parse_port_entry(text)
                    .map_err(|e| Error::validation(format!("config.extra_required_ports[{i}]"), e))
            })
            .collect()
    }

    pub fn verifier(&self) -> Result<Verifier> {
        Ok(Verifier::new()
            .with_probe_source(self.probe.source)
            .with_probe_interface(self.probe.interface.clone())
            .with_socket_address(self.probe.socket_address)
            .with_health_check_port(self.probe.health_check_port)
            .with_timeout(Duration::from_secs(self.probe_timeout_secs))
            .with_extra_ports(self.extra_ports()?))
    }

    pub fn host(&self) -> ProcHost {
        match self.host_root {
            Some(ref root) => ProcHost::with_root(root),
            None => ProcHost::new(),
        }
    }
}

/// Loads the engine config and applies environment overrides.
///
/// An explicitly named file must exist; the default location is optional.
pub async fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => get_config_dir()
            .map(|dir| dir.join("config.json"))
            .filter(|p| p.exists()),
    };

    let mut config = match path {
        Some(path) => {
            debug!("Loading config from {}", path.display());
            let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                Error::validation("config", format!("cannot read {}: {e}", path.display()))
            })?;
            EngineConfig::from_json_str(&text)?
        }
        None => EngineConfig::default(),
    };

    config.apply_env();
    Ok(config)
}
