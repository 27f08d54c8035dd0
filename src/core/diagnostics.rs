//! Read-only triage of "why is this port blocked?"
//!
//! Combines the live rule set with host state (kernel modules, sysctls,
//! listening sockets, interfaces) and ranks the findings so the most likely
//! root cause comes first:
//!
//! 1. missing kernel module
//! 2. sysctl unset
//! 3. port not in any allow clause
//! 4. port shadowed by a higher-priority deny
//! 5. service not listening
//!
//! Everything else is informational. Host access goes through
//! [`HostInspector`] so reports can be produced against a fake root.

use crate::core::backend::NftBackend;
use crate::core::compiler::compile;
use crate::core::enforce::HostLock;
use crate::core::error::Result;
use crate::core::eval::{evaluate, matching_rules};
use crate::core::policy::{ChainName, ClauseKind, Policy, Transport};
use crate::core::ruleset::{RuleSet, Verdict};
use crate::core::verify::Verifier;
use crate::utils::matches_pattern;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ranked finding categories; declaration order is severity order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    #[strum(serialize = "missing kernel module")]
    MissingModule,
    #[strum(serialize = "sysctl unset")]
    SysctlUnset,
    #[strum(serialize = "port not allowed")]
    PortNotAllowed,
    #[strum(serialize = "shadowed by deny")]
    ShadowedByDeny,
    #[strum(serialize = "not listening")]
    NotListening,
    #[strum(serialize = "info")]
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub subject: String,
    pub message: String,
    pub hint: Option<String>,
}

impl Finding {
    fn new(kind: FindingKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
            hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_violation(&self) -> bool {
        self.kind != FindingKind::Info
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)?;
        if let Some(ref hint) = self.hint {
            write!(f, "\n    hint: {hint}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub table: String,
    pub installed: bool,
    pub generation: Option<u64>,
    /// Ranked, most likely root cause first
    pub findings: Vec<Finding>,
}

impl Report {
    /// Most likely root cause, if anything is wrong
    pub fn first_violation(&self) -> Option<&Finding> {
        self.findings.iter().find(|f| f.is_violation())
    }

    pub fn violations(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_violation())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.installed, self.generation) {
            (true, Some(g)) => writeln!(f, "table inet {}: installed, generation {g}", self.table)?,
            (true, None) => writeln!(f, "table inet {}: installed, no generation stamp", self.table)?,
            (false, _) => writeln!(f, "table inet {}: not installed", self.table)?,
        }
        if self.findings.is_empty() {
            return writeln!(f, "No problems found.");
        }
        for finding in &self.findings {
            writeln!(f, "{finding}")?;
        }
        Ok(())
    }
}

/// A socket in LISTEN state (TCP) or bound (UDP)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListeningSocket {
    pub protocol: Transport,
    pub port: u16,
}

/// Read-only view of host state
pub trait HostInspector: Send + Sync {
    fn listening(&self) -> Vec<ListeningSocket>;
    fn module_loaded(&self, name: &str) -> bool;
    /// Value of `key` (dotted form), `None` if the sysctl does not exist
    fn sysctl(&self, key: &str) -> Option<String>;
    fn interfaces(&self) -> Vec<String>;
}

/// Host inspector reading procfs and sysfs, optionally under a fake root
#[derive(Debug, Clone)]
pub struct ProcHost {
    root: PathBuf,
    live_interfaces: bool,
}

impl Default for ProcHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcHost {
    /// The running host
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
            live_interfaces: true,
        }
    }

    /// A host tree rooted at `root` (`<root>/proc`, `<root>/sys`)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            live_interfaces: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(relative)).ok()
    }
}

/// TCP_LISTEN in `/proc/net/tcp*`
const TCP_LISTEN: &str = "0A";
/// TCP_CLOSE, which UDP uses for bound unconnected sockets
const UDP_UNCONNECTED: &str = "07";

fn parse_proc_net(content: &str, protocol: Transport) -> Vec<ListeningSocket> {
    let wanted = match protocol {
        Transport::Tcp => TCP_LISTEN,
        Transport::Udp => UDP_UNCONNECTED,
    };
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            if !state.eq_ignore_ascii_case(wanted) {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            Some(ListeningSocket { protocol, port })
        })
        .collect()
}

impl HostInspector for ProcHost {
    fn listening(&self) -> Vec<ListeningSocket> {
        let mut sockets = BTreeSet::new();
        for (file, protocol) in [
            ("proc/net/tcp", Transport::Tcp),
            ("proc/net/tcp6", Transport::Tcp),
            ("proc/net/udp", Transport::Udp),
            ("proc/net/udp6", Transport::Udp),
        ] {
            if let Some(content) = self.read(file) {
                sockets.extend(parse_proc_net(&content, protocol));
            }
        }
        sockets.into_iter().collect()
    }

    fn module_loaded(&self, name: &str) -> bool {
        let listed = self.read("proc/modules").is_some_and(|modules| {
            modules
                .lines()
                .any(|line| line.split_whitespace().next() == Some(name))
        });
        // Built-in modules only show up in sysfs
        listed || self.root.join("sys/module").join(name).exists()
    }

    fn sysctl(&self, key: &str) -> Option<String> {
        let relative = format!("proc/sys/{}", key.replace('.', "/"));
        self.read(&relative).map(|v| v.trim().to_string())
    }

    fn interfaces(&self) -> Vec<String> {
        if self.live_interfaces {
            use network_interface::{NetworkInterface, NetworkInterfaceConfig};
            match NetworkInterface::show() {
                Ok(interfaces) => {
                    let names: BTreeSet<String> = interfaces.into_iter().map(|i| i.name).collect();
                    return names.into_iter().collect();
                }
                Err(e) => warn!("Interface discovery failed, falling back to sysfs: {e}"),
            }
        }
        crate::utils::list_interfaces(&self.root)
    }
}

pub struct Diagnostics<'a, B: NftBackend, H: HostInspector> {
    backend: &'a B,
    host: &'a H,
    table: String,
    verifier: Verifier,
    lock: Option<HostLock>,
}

impl<'a, B: NftBackend, H: HostInspector> Diagnostics<'a, B, H> {
    pub fn new(backend: &'a B, host: &'a H, table: impl Into<String>) -> Self {
        Self {
            backend,
            host,
            table: table.into(),
            verifier: Verifier::default(),
            lock: None,
        }
    }

    /// Probe source, interface and extra endpoints come from `verifier`.
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Holds a shared host lock while reading so no apply overlaps.
    pub fn with_lock(mut self, lock: HostLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub async fn diagnose(&self, policy: &Policy) -> Result<Report> {
        let _guard = match self.lock {
            Some(ref lock) => Some(lock.shared().await?),
            None => None,
        };

        let mut findings = Vec::new();
        findings.extend(self.check_modules(policy));
        findings.extend(self.check_sysctls(policy));

        let compiled = compile(policy, &self.table);
        let (live, installed) = match self.backend.list_table(&self.table).await {
            Ok(Some(listing)) => match RuleSet::from_nftables_json(&listing, &self.table) {
                Ok(live) => (Some(live), true),
                Err(e) => {
                    findings.push(Finding::new(
                        FindingKind::Info,
                        format!("table inet {}", self.table),
                        format!("live table unreadable ({e}); analysing the compiled rule set"),
                    ));
                    (None, true)
                }
            },
            Ok(None) => {
                findings.push(
                    Finding::new(
                        FindingKind::Info,
                        format!("table inet {}", self.table),
                        "rule set not installed; analysing the compiled rule set",
                    )
                    .hint("knfw apply POLICY"),
                );
                (None, false)
            }
            Err(e) => {
                findings.push(Finding::new(
                    FindingKind::Info,
                    format!("table inet {}", self.table),
                    format!("cannot read live rules ({e}); analysing the compiled rule set"),
                ));
                (None, false)
            }
        };

        let generation = live.as_ref().and_then(|l| l.generation);
        if let Some(ref live) = live {
            let same = live.fingerprint == compiled.fingerprint;
            findings.push(Finding::new(
                FindingKind::Info,
                format!("table inet {}", self.table),
                format!(
                    "generation {}, fingerprint {}{}",
                    live.generation.map_or_else(|| "unknown".to_string(), |g| g.to_string()),
                    if same { "matches the policy" } else { "differs from the policy" },
                    if live.has_drifted() { "; content edited since it was stamped" } else { "" }
                ),
            ));
        }

        let ruleset = live.as_ref().unwrap_or(&compiled);
        findings.extend(self.check_endpoints(policy, ruleset));
        findings.extend(self.check_interfaces(policy));

        // Stable: same-kind findings keep discovery order
        findings.sort_by_key(|f| f.kind);

        debug!(findings = findings.len(), "Diagnostics complete");
        Ok(Report {
            table: self.table.clone(),
            installed,
            generation,
            findings,
        })
    }

    fn check_modules(&self, policy: &Policy) -> Vec<Finding> {
        required_modules(policy)
            .into_iter()
            .filter(|module| !self.host.module_loaded(module))
            .map(|module| {
                Finding::new(FindingKind::MissingModule, module, "kernel module not loaded")
                    .hint(format!("modprobe {module}"))
            })
            .collect()
    }

    fn check_sysctls(&self, policy: &Policy) -> Vec<Finding> {
        required_sysctls(policy)
            .into_iter()
            .filter_map(|key| {
                let value = self.host.sysctl(key);
                if value.as_deref() == Some("1") {
                    return None;
                }
                let observed = value.unwrap_or_else(|| "missing".to_string());
                Some(
                    Finding::new(FindingKind::SysctlUnset, key, format!("is {observed}, expected 1"))
                        .hint(format!("sysctl -w {key}=1")),
                )
            })
            .collect()
    }

    fn check_endpoints(&self, policy: &Policy, ruleset: &RuleSet) -> Vec<Finding> {
        let input = ChainName::Input.as_str();
        if ruleset.chain(input).is_none() {
            return vec![
                Finding::new(
                    FindingKind::PortNotAllowed,
                    format!("chain {input}"),
                    format!("missing from table inet {}; no endpoint can be checked", ruleset.table),
                )
                .hint("knfw apply POLICY"),
            ];
        }

        let interface = self.verifier.probe_interface().to_string();
        let listening = self.host.listening();

        self.verifier
            .required_endpoints(policy)
            .into_iter()
            .filter_map(|endpoint| {
                let subject = format!("{}/{} ({})", endpoint.protocol, endpoint.port, endpoint.label);
                // Every probe source must be accepted; report the first that is not
                let denied = self
                    .verifier
                    .probe_packets(policy, &endpoint)
                    .into_iter()
                    .filter_map(|packet| evaluate(ruleset, input, &packet).map(|d| (packet, d)))
                    .find(|(_, decision)| !decision.is_accept());
                let (packet, decision) = match denied {
                    Some(denied) => denied,
                    None => {
                        let bound = listening
                            .iter()
                            .any(|s| s.protocol == endpoint.protocol && s.port == endpoint.port);
                        return (!bound).then(|| {
                            Finding::new(
                                FindingKind::NotListening,
                                subject,
                                "allowed by the firewall but nothing is listening",
                            )
                            .hint("check that the service is running")
                        });
                    }
                };

                let later_accept = decision.rule_index.and_then(|deny_index| {
                    matching_rules(ruleset, input, &packet)
                        .into_iter()
                        .find(|(i, r)| *i > deny_index && r.verdict == Some(Verdict::Accept))
                });

                Some(match later_accept {
                    Some((accept_index, accept)) => Finding::new(
                        FindingKind::ShadowedByDeny,
                        subject,
                        format!(
                            "{}; rule #{accept_index} ({}) would accept it",
                            decision.describe(),
                            accept.comment.as_deref().unwrap_or("no comment")
                        ),
                    )
                    .hint("move the allow clause to a higher-priority kind or narrow the deny"),
                    None => Finding::new(
                        FindingKind::PortNotAllowed,
                        subject,
                        format!("{} from {} on {interface}", decision.describe(), packet.saddr),
                    )
                    .hint("add the port to a port set referenced by an accept clause in chains.input"),
                })
            })
            .collect()
    }

    fn check_interfaces(&self, policy: &Policy) -> Vec<Finding> {
        let host_interfaces = self.host.interfaces();
        policy
            .interface_patterns
            .iter()
            .flat_map(|(set, patterns)| patterns.iter().map(move |p| (set, p)))
            .filter(|(_, pattern)| !host_interfaces.iter().any(|name| matches_pattern(pattern, name)))
            .map(|(set, pattern)| {
                Finding::new(
                    FindingKind::Info,
                    format!("interface_patterns.{set}"),
                    format!("pattern '{pattern}' matches no interface on this host"),
                )
            })
            .collect()
    }
}

fn has_clause(policy: &Policy, chain: ChainName, kind: ClauseKind) -> bool {
    policy.chain(chain).clauses.iter().any(|c| c.kind == kind)
}

/// Kernel modules the policy depends on
pub fn required_modules(policy: &Policy) -> Vec<&'static str> {
    let mut modules = vec!["nf_tables", "nf_conntrack"];
    if !policy.nat.is_empty() {
        modules.extend(["nft_masq", "nf_nat"]);
    }
    if has_clause(policy, ChainName::Forward, ClauseKind::Interface) {
        modules.push("br_netfilter");
    }
    let overlay = [ChainName::Input, ChainName::Forward, ChainName::Output]
        .into_iter()
        .any(|chain| has_clause(policy, chain, ClauseKind::Overlay));
    if overlay {
        modules.push("vxlan");
    }
    modules
}

/// Sysctls that must be `1` for the policy to work
pub fn required_sysctls(policy: &Policy) -> Vec<&'static str> {
    let mut keys = Vec::new();
    if !policy.forward.clauses.is_empty() || !policy.nat.is_empty() {
        keys.push("net.ipv4.ip_forward");
    }
    if policy
        .cluster_set()
        .is_some_and(|(_, set)| set.v6().next().is_some())
    {
        keys.push("net.ipv6.conf.all.forwarding");
    }
    if has_clause(policy, ChainName::Forward, ClauseKind::Interface) {
        keys.push("net.bridge.bridge-nf-call-iptables");
    }
    keys
}
