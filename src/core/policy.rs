//! Declarative node network policy
//!
//! A policy document names CIDR sets, port sets and interface pattern sets,
//! and references them from per-chain clauses and NAT rules. Loading a
//! document validates every reference up front so that the compiler never
//! sees a dangling name.
//!
//! # Example
//!
//! ```
//! use knfw::core::policy::Policy;
//!
//! let doc = r#"{
//!     "role": "control-plane",
//!     "cidr_sets": { "cluster_networks": { "cluster": true, "entries": ["10.42.0.0/16", "10.43.0.0/16"] } },
//!     "port_sets": { "control-plane": { "control_plane": true, "must_remain_reachable": true,
//!         "entries": [ {"protocol": "tcp", "port": 6443}, {"protocol": "tcp", "port": 10250} ] } },
//!     "chains": { "input": { "clauses": [ {"kind": "control_plane", "ports": "control-plane"} ] } }
//! }"#;
//!
//! let loaded = Policy::from_json_str(doc, false).unwrap();
//! assert_eq!(loaded.policy.port_sets["control-plane"].entries.len(), 2);
//! // input has no cluster CIDR allow clause: reported as a lint, not an error
//! assert!(!loaded.warnings.is_empty());
//! ```

use crate::core::error::{Error, Result};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Maximum number of entries in a single CIDR or port set
pub const MAX_SET_ENTRIES: usize = 4096;

/// Maximum number of clauses per chain
pub const MAX_CLAUSES: usize = 1000;

/// Node role, decides which endpoints must always stay reachable
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[strum(serialize = "control-plane")]
    ControlPlane,
    #[default]
    #[strum(serialize = "worker")]
    Worker,
}

/// Transport protocol of a port set entry
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Transport {
    pub const fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One `{protocol, port-or-range}` service definition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortEntry {
    pub protocol: Transport,
    pub range: PortRange,
}

impl PortEntry {
    pub fn new(protocol: Transport, start: u16, end: u16) -> Self {
        Self {
            protocol,
            range: PortRange { start, end },
        }
    }
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.range)
    }
}

/// Clause or default action
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

/// Filter chain a policy section applies to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ChainName {
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "forward")]
    Forward,
    #[strum(serialize = "output")]
    Output,
}

impl ChainName {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChainName::Input => "input",
            ChainName::Forward => "forward",
            ChainName::Output => "output",
        }
    }

    /// Default action when the document does not declare one.
    ///
    /// Egress is trusted: only `output` defaults to accept.
    pub const fn default_action(self) -> Action {
        match self {
            ChainName::Input | ChainName::Forward => Action::Drop,
            ChainName::Output => Action::Accept,
        }
    }
}

/// Priority slot of a clause.
///
/// Variant declaration order IS the emission order inside a chain.
/// Reordering these variants changes first-match behaviour and is a breaking change.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum ClauseKind {
    #[strum(serialize = "loopback")]
    Loopback,
    #[strum(serialize = "established")]
    Established,
    #[strum(serialize = "admin")]
    Admin,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "control_plane")]
    ControlPlane,
    #[strum(serialize = "cluster_cidr")]
    ClusterCidr,
    #[strum(serialize = "service")]
    Service,
    #[strum(serialize = "overlay")]
    Overlay,
    #[strum(serialize = "node_port")]
    NodePort,
    #[strum(serialize = "interface")]
    Interface,
}

impl ClauseKind {
    /// Kinds whose clauses must name a port set
    pub const fn requires_ports(self) -> bool {
        matches!(
            self,
            ClauseKind::Admin
                | ClauseKind::ControlPlane
                | ClauseKind::Service
                | ClauseKind::Overlay
                | ClauseKind::NodePort
        )
    }

    /// Loopback and established traffic are always emitted as the fast path
    pub const fn is_fast_path(self) -> bool {
        matches!(self, ClauseKind::Loopback | ClauseKind::Established)
    }
}

/// A single allow/deny clause of a chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Clause {
    pub kind: ClauseKind,
    #[serde(default)]
    pub action: Action,
    /// CIDR set name matched against the source address
    #[serde(default)]
    pub sources: Option<String>,
    /// Port set name matched against the destination port
    #[serde(default)]
    pub ports: Option<String>,
    /// Interface pattern set name
    #[serde(default)]
    pub interfaces: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPolicy {
    pub chain: ChainName,
    pub policy: Action,
    pub clauses: Vec<Clause>,
}

impl ChainPolicy {
    pub fn empty(chain: ChainName) -> Self {
        Self {
            chain,
            policy: chain.default_action(),
            clauses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrSet {
    /// Marks the "cluster networks" set
    pub cluster: bool,
    pub entries: Vec<IpNetwork>,
}

impl CidrSet {
    pub fn v4(&self) -> impl Iterator<Item = &IpNetwork> {
        self.entries.iter().filter(|n| n.is_ipv4())
    }

    pub fn v6(&self) -> impl Iterator<Item = &IpNetwork> {
        self.entries.iter().filter(|n| n.is_ipv6())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSet {
    /// Required for the control-plane role
    pub control_plane: bool,
    /// Verified after every apply
    pub must_remain_reachable: bool,
    pub entries: Vec<PortEntry>,
}

impl PortSet {
    pub fn protocol_entries(&self, protocol: Transport) -> impl Iterator<Item = &PortEntry> {
        self.entries.iter().filter(move |e| e.protocol == protocol)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum NatAction {
    #[default]
    #[strum(serialize = "masquerade")]
    Masquerade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// CIDR set of cluster-internal sources
    pub source: String,
    /// Interface pattern set that never gets masqueraded
    pub exclude_interfaces: Option<String>,
    pub action: NatAction,
}

/// Validated, in-memory policy model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub role: Role,
    pub cidr_sets: BTreeMap<String, CidrSet>,
    pub port_sets: BTreeMap<String, PortSet>,
    pub interface_patterns: BTreeMap<String, Vec<String>>,
    pub input: ChainPolicy,
    pub forward: ChainPolicy,
    pub output: ChainPolicy,
    pub nat: Vec<NatRule>,
}

/// Non-fatal finding raised while loading a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    pub field: String,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    pub policy: Policy,
    pub warnings: Vec<LintWarning>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Document (wire) format
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    #[serde(default)]
    role: Role,
    #[serde(default)]
    cidr_sets: BTreeMap<String, CidrSetDocument>,
    #[serde(default)]
    port_sets: BTreeMap<String, PortSetDocument>,
    #[serde(default)]
    interface_patterns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    chains: ChainsDocument,
    #[serde(default)]
    nat: Vec<NatDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CidrSetDocument {
    #[serde(default)]
    cluster: bool,
    #[serde(default)]
    entries: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortSetDocument {
    #[serde(default)]
    control_plane: bool,
    #[serde(default)]
    must_remain_reachable: bool,
    #[serde(default)]
    entries: Vec<PortEntryDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortEntryDocument {
    protocol: Transport,
    port: PortSpec,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(u64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChainsDocument {
    input: Option<ChainDocument>,
    forward: Option<ChainDocument>,
    output: Option<ChainDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChainDocument {
    policy: Option<Action>,
    #[serde(default)]
    clauses: Vec<Clause>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NatDocument {
    source: String,
    #[serde(default)]
    exclude_interfaces: Option<String>,
    #[serde(default)]
    action: NatAction,
}

// ═══════════════════════════════════════════════════════════════════════════

impl Policy {
    /// Parses and validates a JSON policy document.
    ///
    /// In strict mode every lint warning is fatal.
    ///
    /// # Errors
    ///
    /// `Error::Validation` naming the offending field, or `Error::MalformedCidr`.
    pub fn from_json_str(text: &str, strict: bool) -> Result<LoadedPolicy> {
        let doc: PolicyDocument = serde_json::from_str(text)
            .map_err(|e| Error::validation("document", e.to_string()))?;
        Self::from_document(doc, strict)
    }

    fn from_document(doc: PolicyDocument, strict: bool) -> Result<LoadedPolicy> {
        let cidr_sets = validate_cidr_sets(doc.cidr_sets)?;
        let port_sets = validate_port_sets(doc.port_sets)?;
        let interface_patterns = validate_interface_sets(doc.interface_patterns)?;

        let mut policy = Policy {
            role: doc.role,
            cidr_sets,
            port_sets,
            interface_patterns,
            input: ChainPolicy::empty(ChainName::Input),
            forward: ChainPolicy::empty(ChainName::Forward),
            output: ChainPolicy::empty(ChainName::Output),
            nat: Vec::new(),
        };

        for (name, chain_doc) in [
            (ChainName::Input, doc.chains.input),
            (ChainName::Forward, doc.chains.forward),
            (ChainName::Output, doc.chains.output),
        ] {
            if let Some(chain_doc) = chain_doc {
                let chain = policy.validate_chain(name, chain_doc)?;
                *policy.chain_mut(name) = chain;
            }
        }

        for (i, nat) in doc.nat.into_iter().enumerate() {
            let field = format!("nat[{i}]");
            policy.require_cidr_set(&format!("{field}.source"), &nat.source)?;
            if let Some(ref exclude) = nat.exclude_interfaces {
                policy.require_interface_set(&format!("{field}.exclude_interfaces"), exclude)?;
            }
            policy.nat.push(NatRule {
                source: nat.source,
                exclude_interfaces: nat.exclude_interfaces,
                action: nat.action,
            });
        }

        let warnings = policy.lint();
        if strict && let Some(first) = warnings.first() {
            return Err(Error::validation(
                first.field.clone(),
                format!("{} (strict mode)", first.message),
            ));
        }

        for warning in &warnings {
            tracing::warn!(field = %warning.field, "Policy lint: {}", warning.message);
        }

        Ok(LoadedPolicy { policy, warnings })
    }

    pub fn chain(&self, name: ChainName) -> &ChainPolicy {
        match name {
            ChainName::Input => &self.input,
            ChainName::Forward => &self.forward,
            ChainName::Output => &self.output,
        }
    }

    fn chain_mut(&mut self, name: ChainName) -> &mut ChainPolicy {
        match name {
            ChainName::Input => &mut self.input,
            ChainName::Forward => &mut self.forward,
            ChainName::Output => &mut self.output,
        }
    }

    /// The CIDR set marked `cluster: true`, if any
    pub fn cluster_set(&self) -> Option<(&str, &CidrSet)> {
        self.cidr_sets
            .iter()
            .find(|(_, set)| set.cluster)
            .map(|(name, set)| (name.as_str(), set))
    }

    fn require_cidr_set(&self, field: &str, name: &str) -> Result<()> {
        if self.cidr_sets.contains_key(name) {
            Ok(())
        } else {
            Err(Error::validation(field, format!("unknown CIDR set '{name}'")))
        }
    }

    fn require_port_set(&self, field: &str, name: &str) -> Result<()> {
        if self.port_sets.contains_key(name) {
            Ok(())
        } else {
            Err(Error::validation(field, format!("unknown port set '{name}'")))
        }
    }

    fn require_interface_set(&self, field: &str, name: &str) -> Result<()> {
        match self.interface_patterns.get(name) {
            None => Err(Error::validation(
                field,
                format!("unknown interface pattern set '{name}'"),
            )),
            Some(patterns) if patterns.is_empty() => Err(Error::validation(
                field,
                format!("interface pattern set '{name}' is empty"),
            )),
            Some(_) => Ok(()),
        }
    }

    fn validate_chain(&self, name: ChainName, doc: ChainDocument) -> Result<ChainPolicy> {
        if doc.clauses.len() > MAX_CLAUSES {
            return Err(Error::validation(
                format!("chains.{name}"),
                format!("too many clauses (max {MAX_CLAUSES})"),
            ));
        }

        let mut clauses = Vec::with_capacity(doc.clauses.len());
        for (i, mut clause) in doc.clauses.into_iter().enumerate() {
            let field = format!("chains.{name}.clauses[{i}]");

            if let Some(ref sources) = clause.sources {
                self.require_cidr_set(&format!("{field}.sources"), sources)?;
            }
            if let Some(ref ports) = clause.ports {
                self.require_port_set(&format!("{field}.ports"), ports)?;
            }
            if let Some(ref interfaces) = clause.interfaces {
                self.require_interface_set(&format!("{field}.interfaces"), interfaces)?;
            }

            if clause.kind.requires_ports() && clause.ports.is_none() {
                return Err(Error::validation(
                    field,
                    format!("clause kind '{}' requires a port set", clause.kind),
                ));
            }
            match clause.kind {
                ClauseKind::ClusterCidr if clause.sources.is_none() => {
                    return Err(Error::validation(
                        field,
                        "clause kind 'cluster_cidr' requires a CIDR set in 'sources'",
                    ));
                }
                ClauseKind::Interface if clause.interfaces.is_none() => {
                    return Err(Error::validation(
                        field,
                        "clause kind 'interface' requires an interface pattern set",
                    ));
                }
                ClauseKind::Icmp if clause.ports.is_some() => {
                    return Err(Error::validation(
                        field,
                        "icmp clauses cannot match ports",
                    ));
                }
                _ => {}
            }

            clause.comment = clause
                .comment
                .as_deref()
                .map(validators::sanitize_label)
                .filter(|c| !c.is_empty());
            clauses.push(clause);
        }

        Ok(ChainPolicy {
            chain: name,
            policy: doc.policy.unwrap_or(name.default_action()),
            clauses,
        })
    }

    /// Structural checks that are warnings by default and fatal in strict mode.
    pub fn lint(&self) -> Vec<LintWarning> {
        let mut warnings = Vec::new();

        match self.cluster_set() {
            None => warnings.push(LintWarning {
                field: "cidr_sets".into(),
                message: "no CIDR set is marked 'cluster: true'; cluster traffic cannot be allowed"
                    .into(),
            }),
            Some((cluster, _)) => {
                for chain in [&self.input, &self.forward] {
                    let allows_cluster = chain.clauses.iter().any(|c| {
                        c.action == Action::Accept && c.sources.as_deref() == Some(cluster)
                    });
                    if !allows_cluster {
                        warnings.push(LintWarning {
                            field: format!("chains.{}", chain.chain),
                            message: format!(
                                "no accept clause for cluster networks '{cluster}'; pods may become unreachable"
                            ),
                        });
                    }
                }
            }
        }

        for chain in [&self.input, &self.forward] {
            if chain.policy == Action::Accept {
                warnings.push(LintWarning {
                    field: format!("chains.{}.policy", chain.chain),
                    message: "default action is accept; the host firewall is not restrictive"
                        .into(),
                });
            }
        }

        if self.role == Role::ControlPlane {
            let control_plane: Vec<_> = self
                .port_sets
                .iter()
                .filter(|(_, set)| set.control_plane)
                .collect();
            if control_plane.is_empty() {
                warnings.push(LintWarning {
                    field: "port_sets".into(),
                    message: "role is control-plane but no port set is flagged 'control_plane'"
                        .into(),
                });
            }
            for (name, set) in control_plane {
                if set.entries.is_empty() {
                    warnings.push(LintWarning {
                        field: format!("port_sets.{name}"),
                        message: "required for control-plane but empty".into(),
                    });
                }
            }
        }

        warnings
    }
}

fn check_identifiers<'a>(kind: &str, names: impl Iterator<Item = &'a String>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        validators::validate_set_name(name)
            .map_err(|e| Error::validation(format!("{kind}.{name}"), e))?;
        if !seen.insert(validators::nft_identifier(name)) {
            return Err(Error::validation(
                format!("{kind}.{name}"),
                "name collides with another set once '-' is mapped to '_'",
            ));
        }
    }
    Ok(())
}

fn validate_cidr_sets(
    docs: BTreeMap<String, CidrSetDocument>,
) -> Result<BTreeMap<String, CidrSet>> {
    check_identifiers("cidr_sets", docs.keys())?;

    let mut sets = BTreeMap::new();
    let mut cluster: Option<String> = None;

    for (name, doc) in docs {
        if doc.entries.len() > MAX_SET_ENTRIES {
            return Err(Error::validation(
                format!("cidr_sets.{name}"),
                format!("too many entries (max {MAX_SET_ENTRIES})"),
            ));
        }

        if doc.cluster {
            if let Some(ref existing) = cluster {
                return Err(Error::validation(
                    format!("cidr_sets.{name}.cluster"),
                    format!("'{existing}' is already marked as the cluster set"),
                ));
            }
            cluster = Some(name.clone());
        }

        let mut entries = Vec::with_capacity(doc.entries.len());
        for (i, raw) in doc.entries.iter().enumerate() {
            let field = format!("cidr_sets.{name}.entries[{i}]");
            let malformed = |reason: String| Error::MalformedCidr {
                field: field.clone(),
                value: raw.clone(),
                reason,
            };
            let parsed: IpNetwork = raw.trim().parse().map_err(|e| malformed(format!("{e}")))?;
            // Mask host bits so "10.42.1.7/16" and "10.42.0.0/16" compile identically
            let network =
                IpNetwork::new(parsed.network(), parsed.prefix()).map_err(|e| malformed(format!("{e}")))?;
            entries.push(network);
        }

        sets.insert(
            name,
            CidrSet {
                cluster: doc.cluster,
                entries,
            },
        );
    }

    Ok(sets)
}

fn validate_port_sets(
    docs: BTreeMap<String, PortSetDocument>,
) -> Result<BTreeMap<String, PortSet>> {
    check_identifiers("port_sets", docs.keys())?;

    let mut sets = BTreeMap::new();
    for (name, doc) in docs {
        if doc.entries.len() > MAX_SET_ENTRIES {
            return Err(Error::validation(
                format!("port_sets.{name}"),
                format!("too many entries (max {MAX_SET_ENTRIES})"),
            ));
        }

        let mut entries = Vec::with_capacity(doc.entries.len());
        for (i, entry) in doc.entries.into_iter().enumerate() {
            let field = format!("port_sets.{name}.entries[{i}].port");
            let (start, end) = match entry.port {
                PortSpec::Number(n) => {
                    let port = u16::try_from(n)
                        .map_err(|_| Error::validation(&field, format!("{n} is not a valid port")))?;
                    validators::validate_port(port)
                        .map(|p| (p, p))
                        .map_err(|e| Error::validation(&field, e))?
                }
                PortSpec::Text(text) => {
                    validators::parse_port_spec(&text).map_err(|e| Error::validation(&field, e))?
                }
            };
            entries.push(PortEntry::new(entry.protocol, start, end));
        }

        sets.insert(
            name,
            PortSet {
                control_plane: doc.control_plane,
                must_remain_reachable: doc.must_remain_reachable,
                entries,
            },
        );
    }

    Ok(sets)
}

fn validate_interface_sets(
    docs: BTreeMap<String, Vec<String>>,
) -> Result<BTreeMap<String, Vec<String>>> {
    check_identifiers("interface_patterns", docs.keys())?;

    for (name, patterns) in &docs {
        for (i, pattern) in patterns.iter().enumerate() {
            validators::validate_interface_pattern(pattern)
                .map_err(|e| Error::validation(format!("interface_patterns.{name}[{i}]"), e))?;
        }
    }

    Ok(docs)
}

/// Loads a policy document from disk.
///
/// # Errors
///
/// Unreadable files are reported as `Error::Validation` on field `document`;
/// the policy is operator input and never touches live state.
pub async fn load_policy(path: &Path, strict: bool) -> Result<LoadedPolicy> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::validation("document", format!("cannot read {}: {e}", path.display()))
    })?;
    Policy::from_json_str(&text, strict)
}
