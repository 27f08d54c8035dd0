//! Post-apply verification of the live rule set
//!
//! Checks are derived from the policy and evaluated against the rule set read
//! back from the kernel:
//!
//! - **reachability**: required endpoints are accepted by `input` from an
//!   external source and from inside the cluster
//! - **nat**: cluster egress is forwarded and masqueraded
//! - **default policy**: chain policies match the declared defaults
//! - **fingerprint**: the content read back hashes to the compiled fingerprint
//!   and matches the stamp in the table comment
//!
//! Every check runs, concurrently, under its own timeout. A timeout counts as
//! a failure.

use crate::core::compiler::{NAT_CHAIN, compile};
use crate::core::eval::{L4, Packet, evaluate};
use crate::core::policy::{
    Action, ChainName, ClauseKind, PortEntry, PortRange, Policy, Role, Transport,
};
use crate::core::ruleset::{Family, RuleSet, Verdict};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// External probe source unless `probe.source` is configured (TEST-NET-1)
pub const FALLBACK_PROBE_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

pub const DEFAULT_PROBE_INTERFACE: &str = "eth0";

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// kube-proxy `/healthz`, polled by load balancers in front of node ports
pub const SERVICE_PROXY_HEALTH_PORT: u16 = 10256;

const API_SERVER_PORT: u16 = 6443;
const KUBELET_PORT: u16 = 10250;

/// Outcome of one verification check
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub expected: String,
    pub observed: String,
    pub passed: bool,
}

impl CheckResult {
    fn new(name: &str, expected: impl Into<String>, observed: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.to_string(),
            expected: expected.into(),
            observed: observed.into(),
            passed,
        }
    }

    /// Failure recorded when the written table cannot be listed or parsed
    pub fn read_back(table: &str, error: &impl fmt::Display) -> Self {
        Self::new(
            "read back",
            format!("table inet {table} listed and parsed"),
            error.to_string(),
            false,
        )
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed { "ok  " } else { "FAIL" };
        write!(
            f,
            "[{mark}] {}: expected {}, observed {}",
            self.name, self.expected, self.observed
        )
    }
}

/// An endpoint that must stay reachable after every apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub label: String,
    pub protocol: Transport,
    pub port: u16,
    /// Set when the admitting clause is scoped to a CIDR set: probes come from
    /// the first host of that set only
    pub source: Option<IpAddr>,
}

#[derive(Debug, Clone)]
enum Check {
    Reachability(Endpoint),
    Nat {
        source: String,
        family: Family,
        saddr: IpAddr,
        iif: Option<String>,
    },
    DefaultPolicy {
        chain: ChainName,
        expected: Action,
    },
    Fingerprint {
        expected: String,
    },
}

impl Check {
    fn name(&self) -> String {
        match self {
            Check::Reachability(ep) => {
                format!("reachability {}/{} ({})", ep.protocol, ep.port, ep.label)
            }
            Check::Nat { source, family, .. } => format!("nat {source} {}", family.suffix()),
            Check::DefaultPolicy { chain, .. } => format!("default_policy {chain}"),
            Check::Fingerprint { .. } => "fingerprint".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    probe_source: Option<IpAddr>,
    probe_interface: String,
    socket_address: Option<IpAddr>,
    timeout: Duration,
    extra_ports: Vec<PortEntry>,
    health_check_port: u16,
}

impl Default for Verifier {
    fn default() -> Self {
        Self {
            probe_source: None,
            probe_interface: DEFAULT_PROBE_INTERFACE.to_string(),
            socket_address: None,
            timeout: DEFAULT_PROBE_TIMEOUT,
            extra_ports: Vec::new(),
            health_check_port: SERVICE_PROXY_HEALTH_PORT,
        }
    }
}

struct Context {
    live: RuleSet,
    sources: Vec<IpAddr>,
    interface: String,
    socket_address: Option<IpAddr>,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_source(mut self, source: Option<IpAddr>) -> Self {
        self.probe_source = source;
        self
    }

    pub fn with_probe_interface(mut self, interface: impl Into<String>) -> Self {
        self.probe_interface = interface.into();
        self
    }

    /// Enables real TCP connect probes against `addr`.
    pub fn with_socket_address(mut self, addr: Option<IpAddr>) -> Self {
        self.socket_address = addr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_extra_ports(mut self, ports: Vec<PortEntry>) -> Self {
        self.extra_ports = ports;
        self
    }

    /// Service-proxy health-check port, required once node ports are opened.
    pub fn with_health_check_port(mut self, port: u16) -> Self {
        self.health_check_port = port;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn probe_interface(&self) -> &str {
        &self.probe_interface
    }

    /// Synthetic new connections to `endpoint` as seen by the `input` chain,
    /// one per probe source
    pub fn probe_packets(&self, policy: &Policy, endpoint: &Endpoint) -> Vec<Packet> {
        endpoint_sources(endpoint, &self.probe_sources(policy))
            .into_iter()
            .map(|source| {
                reachability_packet(source, &self.probe_interface, self.socket_address, endpoint)
            })
            .collect()
    }

    /// Source addresses used for synthetic reachability packets: the external
    /// source (config, else 192.0.2.10) and the first cluster host.
    ///
    /// Both must be accepted; a cluster-wide accept clause alone would pass any
    /// port from a cluster source.
    pub fn probe_sources(&self, policy: &Policy) -> Vec<IpAddr> {
        let mut sources = vec![self.probe_source.unwrap_or(FALLBACK_PROBE_SOURCE)];
        let cluster = policy
            .cluster_set()
            .and_then(|(_, set)| set.entries.first())
            .map(first_host);
        if let Some(cluster) = cluster.filter(|c| !sources.contains(c)) {
            sources.push(cluster);
        }
        sources
    }

    /// Endpoints that must be accepted by the live `input` chain, deduplicated.
    ///
    /// Ranges contribute their first and last port.
    pub fn required_endpoints(&self, policy: &Policy) -> Vec<Endpoint> {
        let single = |port: u16| PortEntry::new(Transport::Tcp, port, port);
        let mut wanted: Vec<(&str, PortEntry)> = Vec::new();

        for (name, set) in policy.port_sets.iter().filter(|(_, s)| s.must_remain_reachable) {
            wanted.extend(set.entries.iter().map(|e| (name.as_str(), *e)));
        }
        let input = &policy.chain(ChainName::Input).clauses;
        for clause in input.iter().filter(|c| c.kind == ClauseKind::Overlay) {
            if let Some(set) = clause.ports.as_ref().and_then(|p| policy.port_sets.get(p)) {
                wanted.extend(set.entries.iter().map(|e| ("overlay", *e)));
            }
        }
        if policy.role == Role::ControlPlane {
            wanted.push(("api-server", single(API_SERVER_PORT)));
        }
        wanted.push(("kubelet", single(KUBELET_PORT)));
        if input.iter().any(|c| c.kind == ClauseKind::NodePort) {
            wanted.push(("service-proxy health", single(self.health_check_port)));
        }
        for entry in &self.extra_ports {
            let start = entry.range.start;
            wanted.push(("extra", PortEntry::new(entry.protocol, start, start)));
        }

        let mut endpoints: Vec<Endpoint> = Vec::new();
        for (label, entry) in wanted {
            let PortRange { start, end } = entry.range;
            for port in [start, end] {
                if endpoints
                    .iter()
                    .any(|e| e.protocol == entry.protocol && e.port == port)
                {
                    continue;
                }
                endpoints.push(Endpoint {
                    label: label.to_string(),
                    protocol: entry.protocol,
                    port,
                    source: admitting_source(policy, entry.protocol, port),
                });
            }
        }
        endpoints
    }

    fn checks(&self, policy: &Policy, live: &RuleSet) -> Vec<Check> {
        let mut checks: Vec<Check> = self
            .required_endpoints(policy)
            .into_iter()
            .map(Check::Reachability)
            .collect();

        for nat in &policy.nat {
            let Some(set) = policy.cidr_sets.get(&nat.source) else {
                continue;
            };
            let iif = nat
                .exclude_interfaces
                .as_ref()
                .and_then(|name| policy.interface_patterns.get(name))
                .and_then(|patterns| patterns.first())
                .map(|p| concrete_interface(p));
            for (family, first) in [(Family::V4, set.v4().next()), (Family::V6, set.v6().next())] {
                if let Some(net) = first {
                    checks.push(Check::Nat {
                        source: nat.source.clone(),
                        family,
                        saddr: first_host(net),
                        iif: iif.clone(),
                    });
                }
            }
        }

        for chain in ChainName::iter() {
            checks.push(Check::DefaultPolicy {
                chain,
                expected: policy.chain(chain).policy,
            });
        }

        checks.push(Check::Fingerprint {
            expected: compile(policy, &live.table).fingerprint,
        });
        checks
    }

    /// Runs every check against `live`; results are in a fixed order.
    pub async fn verify(&self, policy: &Policy, live: &RuleSet) -> Vec<CheckResult> {
        let checks = self.checks(policy, live);
        let ctx = Arc::new(Context {
            live: live.clone(),
            sources: self.probe_sources(policy),
            interface: self.probe_interface.clone(),
            socket_address: self.socket_address,
        });

        let mut set = JoinSet::new();
        for (index, check) in checks.iter().cloned().enumerate() {
            let ctx = Arc::clone(&ctx);
            let timeout = self.timeout;
            set.spawn(async move {
                let name = check.name();
                let result = match tokio::time::timeout(timeout, run_check(check, ctx)).await {
                    Ok(result) => result,
                    Err(_) => CheckResult::new(
                        &name,
                        "completes",
                        format!("timed out after {timeout:?}"),
                        false,
                    ),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<CheckResult>> = vec![None; checks.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Verification task failed: {e}"),
            }
        }

        let results: Vec<CheckResult> = results
            .into_iter()
            .zip(&checks)
            .map(|(result, check)| {
                result.unwrap_or_else(|| {
                    CheckResult::new(&check.name(), "completes", "check task aborted", false)
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.passed).count();
        if failed == 0 {
            info!("All {} verification checks passed", results.len());
        } else {
            for result in results.iter().filter(|r| !r.passed) {
                warn!(check = %result.name, expected = %result.expected, observed = %result.observed, "Verification check failed");
            }
        }
        results
    }
}

async fn run_check(check: Check, ctx: Arc<Context>) -> CheckResult {
    let name = check.name();
    match check {
        Check::Reachability(endpoint) => reachability(&name, &endpoint, &ctx).await,
        Check::Nat {
            family, saddr, iif, ..
        } => nat(&name, family, saddr, iif, &ctx),
        Check::DefaultPolicy { chain, expected } => match ctx.live.chain(chain.as_str()) {
            Some(live) => CheckResult::new(
                &name,
                expected.to_string(),
                live.policy.to_string(),
                live.policy == expected,
            ),
            None => CheckResult::new(&name, expected.to_string(), "chain missing", false),
        },
        Check::Fingerprint { expected } => {
            let live = &ctx.live;
            match live.stamped_fingerprint.as_deref() {
                Some(stamp) if stamp != live.fingerprint => CheckResult::new(
                    &name,
                    expected,
                    format!("content {} differs from stamp {stamp}", live.fingerprint),
                    false,
                ),
                _ => {
                    let passed = live.fingerprint == expected;
                    CheckResult::new(&name, expected, live.fingerprint.clone(), passed)
                }
            }
        }
    }
}

fn reachability_packet(
    source: IpAddr,
    interface: &str,
    socket_address: Option<IpAddr>,
    endpoint: &Endpoint,
) -> Packet {
    let daddr = socket_address
        .filter(|a| Family::of(a) == Family::of(&source))
        .unwrap_or_else(|| documentation_address(Family::of(&source)));
    Packet::to_port(source, daddr, endpoint.protocol, endpoint.port).via_iif(interface)
}

/// Probe sources for `endpoint`: its admitting clause's source, else `defaults`
fn endpoint_sources(endpoint: &Endpoint, defaults: &[IpAddr]) -> Vec<IpAddr> {
    endpoint.source.map_or_else(|| defaults.to_vec(), |source| vec![source])
}

/// First host of the source set of the first accept clause in `input` whose
/// port set covers `protocol`/`port`, if that clause is source-scoped
fn admitting_source(policy: &Policy, protocol: Transport, port: u16) -> Option<IpAddr> {
    let clause = policy
        .chain(ChainName::Input)
        .clauses
        .iter()
        .filter(|c| c.action == Action::Accept)
        .find(|c| {
            c.ports
                .as_ref()
                .and_then(|name| policy.port_sets.get(name))
                .is_some_and(|set| {
                    set.protocol_entries(protocol).any(|e| e.range.contains(port))
                })
        })?;
    let set = policy.cidr_sets.get(clause.sources.as_ref()?)?;
    set.entries.first().map(first_host)
}

async fn reachability(name: &str, endpoint: &Endpoint, ctx: &Context) -> CheckResult {
    let mut accepted = None;
    for source in endpoint_sources(endpoint, &ctx.sources) {
        let packet = reachability_packet(source, &ctx.interface, ctx.socket_address, endpoint);
        let Some(decision) = evaluate(&ctx.live, ChainName::Input.as_str(), &packet) else {
            return CheckResult::new(name, "accept", "input chain missing", false);
        };
        debug!("{name} from {source}: {}", decision.describe());
        if !decision.is_accept() {
            return CheckResult::new(
                name,
                "accept",
                format!("{} from {source}", decision.describe()),
                false,
            );
        }
        accepted.get_or_insert(decision);
    }
    let Some(decision) = accepted else {
        return CheckResult::new(name, "accept", "no probe source", false);
    };

    match (ctx.socket_address, endpoint.protocol) {
        (Some(addr), Transport::Tcp) => {
            let target = SocketAddr::new(addr, endpoint.port);
            match tokio::net::TcpStream::connect(target).await {
                Ok(_) => CheckResult::new(name, "accept", format!("{target} connected"), true),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    CheckResult::new(name, "accept", format!("{target} refused (RST)"), true)
                }
                Err(e) => CheckResult::new(name, "accept", format!("{target}: {e}"), false),
            }
        }
        _ => CheckResult::new(name, "accept", decision.describe(), true),
    }
}

fn nat(name: &str, family: Family, saddr: IpAddr, iif: Option<String>, ctx: &Context) -> CheckResult {
    let mut packet = Packet::new(saddr, documentation_address(family), L4::Tcp(443))
        .via_oif(ctx.interface.clone());
    if let Some(iif) = iif {
        packet = packet.via_iif(iif);
    }

    let expected = "forward not dropped, masquerade in postrouting";
    let forward = evaluate(&ctx.live, ChainName::Forward.as_str(), &packet);
    let forwarded = forward
        .as_ref()
        .is_some_and(|d| !matches!(d.verdict, Verdict::Drop | Verdict::Reject));
    if !forwarded {
        let observed = forward.map_or_else(|| "forward chain missing".to_string(), |d| format!("forward {}", d.describe()));
        return CheckResult::new(name, expected, observed, false);
    }

    match evaluate(&ctx.live, NAT_CHAIN, &packet) {
        Some(d) if d.verdict == Verdict::Masquerade => {
            CheckResult::new(name, expected, format!("postrouting {}", d.describe()), true)
        }
        Some(d) => CheckResult::new(name, expected, format!("postrouting {}", d.describe()), false),
        None => CheckResult::new(name, expected, "postrouting chain missing", false),
    }
}

/// First usable host of a prefix (the address itself for /32 and /128)
pub fn first_host(net: &IpNetwork) -> IpAddr {
    match net {
        IpNetwork::V4(n) if n.prefix() < 32 => {
            IpAddr::V4(Ipv4Addr::from(u32::from(n.network()).saturating_add(1)))
        }
        IpNetwork::V6(n) if n.prefix() < 128 => {
            IpAddr::V6(Ipv6Addr::from(u128::from(n.network()).saturating_add(1)))
        }
        _ => net.ip(),
    }
}

fn documentation_address(family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
        Family::V6 => IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
    }
}

/// An interface name that matches `pattern`
fn concrete_interface(pattern: &str) -> String {
    match pattern.strip_suffix('*') {
        Some(stem) => format!("{stem}0"),
        None => pattern.to_string(),
    }
}
