//! Compiled rule set: typed tables, sets, chains and rules
//!
//! A [`RuleSet`] is what the compiler produces and what the live table parses
//! back into. It renders to an atomic nftables JSON batch
//! ([`RuleSet::to_nftables_json`]) and to a human-readable preview
//! ([`RuleSet::to_nft_text`]). Parsing ([`RuleSet::from_nftables_json`]) accepts
//! both our own batches and `nft -j list table` output.
//!
//! Expressions that this crate does not emit parse as [`Match::Unknown`] and
//! never match during evaluation.

use crate::core::error::{Error, Result};
use crate::core::policy::{Action, Transport};
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// nftables family of the owned table
pub const FAMILY: &str = "inet";

/// Prefix of the table comment that carries generation and fingerprint
const STAMP_PREFIX: &str = "knfw";

/// Address family of a set or address match
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter,
)]
pub enum Family {
    #[strum(serialize = "ip")]
    V4,
    #[strum(serialize = "ip6")]
    V6,
}

impl Family {
    /// Payload protocol name used by `ip saddr` / `ip6 saddr`
    pub const fn payload_protocol(self) -> &'static str {
        match self {
            Family::V4 => "ip",
            Family::V6 => "ip6",
        }
    }

    pub const fn suffix(self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        if addr.is_ipv4() { Family::V4 } else { Family::V6 }
    }
}

/// Layer-4 protocol as seen by `meta l4proto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
}

impl L4Proto {
    pub const fn as_str(self) -> &'static str {
        match self {
            L4Proto::Tcp => "tcp",
            L4Proto::Udp => "udp",
            L4Proto::Icmp => "icmp",
            L4Proto::Icmpv6 => "ipv6-icmp",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(L4Proto::Tcp),
            "udp" => Some(L4Proto::Udp),
            "icmp" => Some(L4Proto::Icmp),
            "ipv6-icmp" | "icmpv6" => Some(L4Proto::Icmpv6),
            _ => None,
        }
    }
}

impl From<Transport> for L4Proto {
    fn from(t: Transport) -> Self {
        match t {
            Transport::Tcp => L4Proto::Tcp,
            Transport::Udp => L4Proto::Udp,
        }
    }
}

/// Connection tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CtState {
    New,
    Established,
    Related,
    Invalid,
    Untracked,
}

impl CtState {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "new" => Some(CtState::New),
            "established" => Some(CtState::Established),
            "related" => Some(CtState::Related),
            "invalid" => Some(CtState::Invalid),
            "untracked" => Some(CtState::Untracked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Source,
    Destination,
}

impl Direction {
    const fn addr_field(self) -> &'static str {
        match self {
            Direction::Source => "saddr",
            Direction::Destination => "daddr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrTarget {
    /// `@name` reference to a named set
    Set(String),
    Prefix(IpNetwork),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortTarget {
    Set(String),
    Single(u16),
    Range(u16, u16),
}

/// One match expression of a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    IifName { pattern: String, negated: bool },
    OifName { pattern: String, negated: bool },
    CtState(Vec<CtState>),
    L4Proto(Vec<L4Proto>),
    Addr {
        family: Family,
        direction: Direction,
        target: AddrTarget,
    },
    /// Destination port, implies the transport protocol
    Dport { protocol: Transport, target: PortTarget },
    /// Anything this crate does not generate; never matches
    Unknown(Value),
}

/// Terminal statement of a rule
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
    Masquerade,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Accept => Verdict::Accept,
            Action::Drop => Verdict::Drop,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub matches: Vec<Match>,
    /// `None` for rules without a terminal statement (e.g. counters, jumps)
    pub verdict: Option<Verdict>,
    pub comment: Option<String>,
}

impl Rule {
    pub fn new(matches: Vec<Match>, verdict: Verdict) -> Self {
        Self {
            matches,
            verdict: Some(verdict),
            comment: None,
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ChainType {
    Filter,
    Nat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Hook {
    Input,
    Forward,
    Output,
    Postrouting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub name: String,
    pub chain_type: ChainType,
    pub hook: Hook,
    pub prio: i32,
    pub policy: Action,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum SetKind {
    #[strum(serialize = "ipv4_addr")]
    Ipv4Addr,
    #[strum(serialize = "ipv6_addr")]
    Ipv6Addr,
    #[strum(serialize = "inet_service")]
    InetService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetElement {
    Prefix(IpNetwork),
    AddrRange(IpAddr, IpAddr),
    Port(u16),
    PortRange(u16, u16),
}

impl SetElement {
    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        match *self {
            SetElement::Prefix(net) => net.contains(addr),
            SetElement::AddrRange(start, end) => {
                Family::of(&start) == Family::of(&addr) && start <= addr && addr <= end
            }
            SetElement::Port(_) | SetElement::PortRange(..) => false,
        }
    }

    pub fn contains_port(&self, port: u16) -> bool {
        match *self {
            SetElement::Port(p) => p == port,
            SetElement::PortRange(start, end) => (start..=end).contains(&port),
            SetElement::Prefix(_) | SetElement::AddrRange(..) => false,
        }
    }

    /// Closed interval covered by the element, addresses as integers
    fn span(&self) -> (u128, u128) {
        match *self {
            SetElement::Prefix(IpNetwork::V4(net)) => {
                let start = u32::from(net.network());
                let hosts = u32::MAX.checked_shr(u32::from(net.prefix())).unwrap_or(0);
                (u128::from(start), u128::from(start | hosts))
            }
            SetElement::Prefix(IpNetwork::V6(net)) => {
                let start = u128::from(net.network());
                let hosts = u128::MAX.checked_shr(u32::from(net.prefix())).unwrap_or(0);
                (start, start | hosts)
            }
            SetElement::AddrRange(a, b) => (addr_bits(a), addr_bits(b)),
            SetElement::Port(p) => (u128::from(p), u128::from(p)),
            SetElement::PortRange(a, b) => (u128::from(a), u128::from(b)),
        }
    }

    fn to_json(self) -> Value {
        match self {
            SetElement::Prefix(net) if net.prefix() == max_prefix(&net) => json!(net.ip().to_string()),
            SetElement::Prefix(net) => {
                json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix() } })
            }
            SetElement::AddrRange(a, b) => json!({ "range": [a.to_string(), b.to_string()] }),
            SetElement::Port(p) => json!(p),
            SetElement::PortRange(a, b) => json!({ "range": [a, b] }),
        }
    }
}

impl fmt::Display for SetElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetElement::Prefix(net) if net.prefix() == max_prefix(net) => write!(f, "{}", net.ip()),
            SetElement::Prefix(net) => write!(f, "{net}"),
            SetElement::AddrRange(a, b) => write!(f, "{a}-{b}"),
            SetElement::Port(p) => write!(f, "{p}"),
            SetElement::PortRange(a, b) => write!(f, "{a}-{b}"),
        }
    }
}

fn addr_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(a)),
        IpAddr::V6(a) => u128::from(a),
    }
}

fn max_prefix(net: &IpNetwork) -> u8 {
    if net.is_ipv4() { 32 } else { 128 }
}

/// Named interval set referenced from rules as `@name`
#[derive(Debug, Clone, PartialEq)]
pub struct NamedSet {
    pub name: String,
    pub kind: SetKind,
    pub elements: Vec<SetElement>,
}

impl NamedSet {
    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        self.elements.iter().any(|e| e.contains_addr(addr))
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.elements.iter().any(|e| e.contains_port(port))
    }

    /// Same set with elements as sorted, merged ranges, which is how the
    /// kernel stores (and `nft` lists) an auto-merged interval set
    fn canonical(&self) -> NamedSet {
        let mut spans: Vec<(u128, u128)> = self.elements.iter().map(|e| e.span()).collect();
        spans.sort_unstable();

        let mut merged: Vec<(u128, u128)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let elements = merged
            .into_iter()
            .map(|(start, end)| match self.kind {
                SetKind::Ipv4Addr => SetElement::AddrRange(
                    IpAddr::V4(Ipv4Addr::from(start as u32)),
                    IpAddr::V4(Ipv4Addr::from(end as u32)),
                ),
                SetKind::Ipv6Addr => SetElement::AddrRange(
                    IpAddr::V6(Ipv6Addr::from(start)),
                    IpAddr::V6(Ipv6Addr::from(end)),
                ),
                SetKind::InetService => SetElement::PortRange(start as u16, end as u16),
            })
            .collect();
        NamedSet {
            name: self.name.clone(),
            kind: self.kind,
            elements,
        }
    }
}

/// Generation and fingerprint recorded in the table comment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStamp {
    pub generation: Option<u64>,
    pub fingerprint: Option<String>,
}

impl TableStamp {
    /// Parses `knfw generation=<n> fingerprint=<hex>`; foreign comments yield `None`.
    pub fn parse(comment: &str) -> Option<Self> {
        let mut words = comment.split_whitespace();
        if words.next() != Some(STAMP_PREFIX) {
            return None;
        }
        let mut stamp = TableStamp {
            generation: None,
            fingerprint: None,
        };
        for word in words {
            match word.split_once('=') {
                Some(("generation", n)) => stamp.generation = n.parse().ok(),
                Some(("fingerprint", hex)) => stamp.fingerprint = Some(hex.to_string()),
                _ => {}
            }
        }
        Some(stamp)
    }
}

/// Complete, self-contained content of the owned table
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub table: String,
    pub generation: Option<u64>,
    /// SHA-256 (hex) of the rendered content, recomputed when parsed
    pub fingerprint: String,
    /// Fingerprint carried by the table comment
    pub stamped_fingerprint: Option<String>,
    pub sets: Vec<NamedSet>,
    pub chains: Vec<Chain>,
}

impl RuleSet {
    /// Builds a rule set and computes its content fingerprint.
    pub fn new(table: impl Into<String>, sets: Vec<NamedSet>, chains: Vec<Chain>) -> Self {
        let mut ruleset = Self {
            table: table.into(),
            generation: None,
            fingerprint: String::new(),
            stamped_fingerprint: None,
            sets,
            chains,
        };
        ruleset.fingerprint = ruleset.compute_fingerprint();
        ruleset
    }

    /// Returns the same rule set stamped with `generation` and its fingerprint.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self.stamped_fingerprint = Some(self.fingerprint.clone());
        self
    }

    /// True if the table comment carries a fingerprint other than the content's
    pub fn has_drifted(&self) -> bool {
        self.stamped_fingerprint
            .as_ref()
            .is_some_and(|stamp| *stamp != self.fingerprint)
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn set(&self, name: &str) -> Option<&NamedSet> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn rule_count(&self) -> usize {
        self.chains.iter().map(|c| c.rules.len()).sum()
    }

    pub fn table_comment(&self) -> String {
        match self.generation {
            Some(generation) => format!(
                "{STAMP_PREFIX} generation={generation} fingerprint={}",
                self.fingerprint
            ),
            None => format!("{STAMP_PREFIX} fingerprint={}", self.fingerprint),
        }
    }

    /// SHA-256 over the canonical JSON of every set, chain and rule.
    ///
    /// Set elements are hashed as merged ranges, so a listing where the kernel
    /// coalesced adjacent prefixes hashes like the batch that created it.
    pub fn compute_fingerprint(&self) -> String {
        let mut content: Vec<Value> = self.sets.iter().map(|s| self.set_add(&s.canonical())).collect();
        content.extend(self.chain_commands());
        let content = Value::Array(content);
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // JSON Helper Functions
    // ═══════════════════════════════════════════════════════════════════════════

    fn table_object(&self, comment: Option<&str>) -> Value {
        let mut table = json!({ "family": FAMILY, "name": self.table });
        if let Some(comment) = comment {
            table["comment"] = json!(comment);
        }
        json!({ "table": table })
    }

    fn set_add(&self, set: &NamedSet) -> Value {
        let mut obj = json!({
            "family": FAMILY,
            "table": self.table,
            "name": set.name,
            "type": set.kind.to_string(),
            "flags": ["interval"],
            "auto-merge": true
        });
        if !set.elements.is_empty() {
            obj["elem"] = Value::Array(set.elements.iter().map(|e| e.to_json()).collect());
        }
        json!({ "add": { "set": obj } })
    }

    fn chain_add(&self, chain: &Chain) -> Value {
        json!({
            "add": {
                "chain": {
                    "family": FAMILY,
                    "table": self.table,
                    "name": chain.name,
                    "type": chain.chain_type.to_string(),
                    "hook": chain.hook.to_string(),
                    "prio": chain.prio,
                    "policy": chain.policy.to_string()
                }
            }
        })
    }

    fn rule_add(&self, chain: &str, rule: &Rule) -> Value {
        let mut expr: Vec<Value> = rule.matches.iter().map(Match::to_json).collect();
        if let Some(verdict) = rule.verdict {
            expr.push(json!({ verdict.as_ref(): null }));
        }
        let mut obj = json!({
            "family": FAMILY,
            "table": self.table,
            "chain": chain,
            "expr": expr
        });
        if let Some(ref comment) = rule.comment {
            obj["comment"] = json!(comment);
        }
        json!({ "add": { "rule": obj } })
    }

    // ═══════════════════════════════════════════════════════════════════════════

    fn content_commands(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.sets.len() + self.chains.len() + self.rule_count());
        out.extend(self.sets.iter().map(|s| self.set_add(s)));
        out.extend(self.chain_commands());
        out
    }

    fn chain_commands(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.chains.len() + self.rule_count());
        out.extend(self.chains.iter().map(|c| self.chain_add(c)));
        for chain in &self.chains {
            out.extend(chain.rules.iter().map(|r| self.rule_add(&chain.name, r)));
        }
        out
    }

    /// Renders the rule set as one atomic nftables JSON batch.
    ///
    /// The table is added (so the delete cannot fail), deleted, and recreated,
    /// which replaces every previous object without leaving duplicates.
    pub fn to_nftables_json(&self) -> Value {
        let comment = self.table_comment();
        let mut nft = Vec::with_capacity(3 + self.sets.len() + self.chains.len() + self.rule_count());

        nft.push(json!({ "add": self.table_object(None) }));
        nft.push(json!({ "delete": self.table_object(None) }));
        nft.push(json!({ "add": self.table_object(Some(&comment)) }));
        nft.extend(self.content_commands());

        json!({ "nftables": nft })
    }

    /// Generates human-readable .nft text for preview.
    pub fn to_nft_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();

        let _ = writeln!(out, "table {FAMILY} {} {{", self.table);
        let _ = writeln!(out, "    comment \"{}\"", self.table_comment());

        for set in &self.sets {
            let _ = writeln!(out);
            let _ = writeln!(out, "    set {} {{", set.name);
            let _ = writeln!(out, "        type {}", set.kind);
            let _ = writeln!(out, "        flags interval");
            let _ = writeln!(out, "        auto-merge");
            if !set.elements.is_empty() {
                let elements: Vec<String> = set.elements.iter().map(ToString::to_string).collect();
                let _ = writeln!(out, "        elements = {{ {} }}", elements.join(", "));
            }
            let _ = writeln!(out, "    }}");
        }

        for chain in &self.chains {
            let _ = writeln!(out);
            let _ = writeln!(out, "    chain {} {{", chain.name);
            let _ = writeln!(
                out,
                "        type {} hook {} priority {}; policy {};",
                chain.chain_type, chain.hook, chain.prio, chain.policy
            );
            for rule in &chain.rules {
                let _ = writeln!(out, "        {rule}");
            }
            let _ = writeln!(out, "    }}");
        }

        let _ = writeln!(out, "}}");
        out
    }

    /// Parses a batch produced by [`RuleSet::to_nftables_json`] or the output of
    /// `nft -j list table inet <table>`.
    ///
    /// # Errors
    ///
    /// `Error::Internal` if the document is not nftables JSON, the table is
    /// missing, or an object of a known kind is malformed.
    pub fn from_nftables_json(value: &Value, table: &str) -> Result<Self> {
        let items = value
            .get("nftables")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("missing 'nftables' array"))?;

        let mut found_table = false;
        let mut comment: Option<String> = None;
        let mut sets: Vec<NamedSet> = Vec::new();
        let mut chains: Vec<Chain> = Vec::new();

        for item in items {
            // Batch commands wrap objects; list output has bare objects
            let (command, object) = match item.as_object().and_then(|o| o.iter().next()) {
                Some((key, inner)) if matches!(key.as_str(), "add" | "create" | "delete" | "flush") => {
                    (key.as_str(), inner)
                }
                Some(_) => ("add", item),
                None => return Err(malformed("empty nftables item")),
            };

            let Some((kind, body)) = object.as_object().and_then(|o| o.iter().next()) else {
                continue;
            };

            if kind == "metainfo" || !belongs_to(body, kind, table) {
                continue;
            }

            match (command, kind.as_str()) {
                ("delete" | "flush", "table") => {
                    sets.clear();
                    if command == "delete" {
                        chains.clear();
                        found_table = false;
                        comment = None;
                    } else {
                        for chain in &mut chains {
                            chain.rules.clear();
                        }
                    }
                }
                ("add" | "create", "table") => {
                    found_table = true;
                    if let Some(c) = body.get("comment").and_then(Value::as_str) {
                        comment = Some(c.to_string());
                    }
                }
                ("add" | "create", "set") => {
                    let set = parse_set(body)?;
                    sets.retain(|s| s.name != set.name);
                    sets.push(set);
                }
                ("add" | "create", "chain") => {
                    let chain = parse_chain(body)?;
                    if !chains.iter().any(|c| c.name == chain.name) {
                        chains.push(chain);
                    }
                }
                ("add" | "create", "rule") => {
                    let chain_name = str_field(body, "chain")?;
                    let rule = parse_rule(body)?;
                    let chain = chains
                        .iter_mut()
                        .find(|c| c.name == chain_name)
                        .ok_or_else(|| malformed(format!("rule references unknown chain '{chain_name}'")))?;
                    chain.rules.push(rule);
                }
                _ => {}
            }
        }

        if !found_table {
            return Err(malformed(format!("table {FAMILY} {table} not present")));
        }

        let mut ruleset = Self::new(table, sets, chains);
        if let Some(stamp) = comment.as_deref().and_then(TableStamp::parse) {
            ruleset.generation = stamp.generation;
            ruleset.stamped_fingerprint = stamp.fingerprint;
        }
        if ruleset.has_drifted() {
            warn!(
                table,
                content = %ruleset.fingerprint,
                stamp = ruleset.stamped_fingerprint.as_deref().unwrap_or_default(),
                "Table content does not match its fingerprint stamp"
            );
        }

        Ok(ruleset)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.matches.iter().map(ToString::to_string).collect();
        if let Some(verdict) = self.verdict {
            parts.push(verdict.to_string());
        }
        if let Some(ref comment) = self.comment {
            parts.push(format!("comment \"{comment}\""));
        }
        write!(f, "{}", parts.join(" "))
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::IifName { pattern, negated } => {
                write!(f, "iifname {}\"{pattern}\"", if *negated { "!= " } else { "" })
            }
            Match::OifName { pattern, negated } => {
                write!(f, "oifname {}\"{pattern}\"", if *negated { "!= " } else { "" })
            }
            Match::CtState(states) => {
                let names: Vec<String> = states.iter().map(ToString::to_string).collect();
                write!(f, "ct state {}", names.join(","))
            }
            Match::L4Proto(protos) => {
                let names: Vec<&str> = protos.iter().map(|p| p.as_str()).collect();
                if names.len() == 1 {
                    write!(f, "meta l4proto {}", names[0])
                } else {
                    write!(f, "meta l4proto {{ {} }}", names.join(", "))
                }
            }
            Match::Addr {
                family,
                direction,
                target,
            } => {
                write!(f, "{} {} ", family.payload_protocol(), direction.addr_field())?;
                match target {
                    AddrTarget::Set(name) => write!(f, "@{name}"),
                    AddrTarget::Prefix(net) => write!(f, "{net}"),
                }
            }
            Match::Dport { protocol, target } => {
                write!(f, "{protocol} dport ")?;
                match target {
                    PortTarget::Set(name) => write!(f, "@{name}"),
                    PortTarget::Single(p) => write!(f, "{p}"),
                    PortTarget::Range(a, b) => write!(f, "{a}-{b}"),
                }
            }
            Match::Unknown(_) => write!(f, "<unsupported expression>"),
        }
    }
}

impl Match {
    fn to_json(&self) -> Value {
        fn matcher(left: Value, op: &str, right: Value) -> Value {
            json!({ "match": { "left": left, "op": op, "right": right } })
        }

        match self {
            Match::IifName { pattern, negated } | Match::OifName { pattern, negated } => {
                let key = if matches!(self, Match::IifName { .. }) {
                    "iifname"
                } else {
                    "oifname"
                };
                matcher(
                    json!({ "meta": { "key": key } }),
                    if *negated { "!=" } else { "==" },
                    json!(pattern),
                )
            }
            Match::CtState(states) => {
                let names: Vec<String> = states.iter().map(ToString::to_string).collect();
                let right = if names.len() == 1 {
                    json!(names[0])
                } else {
                    json!(names)
                };
                matcher(json!({ "ct": { "key": "state" } }), "in", right)
            }
            Match::L4Proto(protos) => {
                let right = if protos.len() == 1 {
                    json!(protos[0].as_str())
                } else {
                    json!({ "set": protos.iter().map(|p| p.as_str()).collect::<Vec<_>>() })
                };
                matcher(json!({ "meta": { "key": "l4proto" } }), "==", right)
            }
            Match::Addr {
                family,
                direction,
                target,
            } => {
                let right = match target {
                    AddrTarget::Set(name) => json!(format!("@{name}")),
                    AddrTarget::Prefix(net) => SetElement::Prefix(*net).to_json(),
                };
                matcher(
                    json!({ "payload": { "protocol": family.payload_protocol(), "field": direction.addr_field() } }),
                    "==",
                    right,
                )
            }
            Match::Dport { protocol, target } => {
                let right = match target {
                    PortTarget::Set(name) => json!(format!("@{name}")),
                    PortTarget::Single(p) => json!(p),
                    PortTarget::Range(a, b) => json!({ "range": [a, b] }),
                };
                matcher(
                    json!({ "payload": { "protocol": protocol.as_str(), "field": "dport" } }),
                    "==",
                    right,
                )
            }
            Match::Unknown(value) => value.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Parsing helpers
// ═══════════════════════════════════════════════════════════════════════════

fn malformed(reason: impl fmt::Display) -> Error {
    Error::Internal(format!("malformed nftables JSON: {reason}"))
}

fn str_field<'a>(body: &'a Value, key: &str) -> Result<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(format!("missing '{key}'")))
}

fn belongs_to(body: &Value, kind: &str, table: &str) -> bool {
    let family_ok = body
        .get("family")
        .and_then(Value::as_str)
        .is_none_or(|f| f == FAMILY);
    let table_key = if kind == "table" { "name" } else { "table" };
    let table_ok = body
        .get(table_key)
        .and_then(Value::as_str)
        .is_none_or(|t| t == table);
    family_ok && table_ok
}

fn parse_set(body: &Value) -> Result<NamedSet> {
    let name = str_field(body, "name")?.to_string();
    let kind_name = str_field(body, "type")?;
    let kind: SetKind = kind_name
        .parse()
        .map_err(|_| malformed(format!("set '{name}' has unsupported type '{kind_name}'")))?;

    let mut elements = Vec::new();
    if let Some(elem) = body.get("elem") {
        let items = match elem {
            Value::Array(items) => items.as_slice(),
            other => std::slice::from_ref(other),
        };
        for item in items {
            elements.push(
                parse_element(item, kind)
                    .ok_or_else(|| malformed(format!("set '{name}' has unparsable element {item}")))?,
            );
        }
    }

    Ok(NamedSet {
        name,
        kind,
        elements,
    })
}

fn parse_addr(value: &Value) -> Option<IpAddr> {
    value.as_str()?.parse().ok()
}

fn parse_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_prefix(value: &Value) -> Option<IpNetwork> {
    match value {
        Value::String(s) if s.contains('/') => s.parse().ok(),
        Value::String(s) => s.parse::<IpAddr>().ok().map(IpNetwork::from),
        Value::Object(o) => {
            let prefix = o.get("prefix")?;
            let addr = parse_addr(prefix.get("addr")?)?;
            let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
            IpNetwork::new(addr, len).ok()
        }
        _ => None,
    }
}

fn parse_element(value: &Value, kind: SetKind) -> Option<SetElement> {
    if let Some(inner) = value.get("elem") {
        return parse_element(inner.get("val")?, kind);
    }

    let range = value.get("range").and_then(Value::as_array);
    match kind {
        SetKind::Ipv4Addr | SetKind::Ipv6Addr => match range {
            Some(bounds) if bounds.len() == 2 => {
                Some(SetElement::AddrRange(parse_addr(&bounds[0])?, parse_addr(&bounds[1])?))
            }
            Some(_) => None,
            None => parse_prefix(value).map(SetElement::Prefix),
        },
        SetKind::InetService => match range {
            Some(bounds) if bounds.len() == 2 => {
                Some(SetElement::PortRange(parse_port(&bounds[0])?, parse_port(&bounds[1])?))
            }
            Some(_) => None,
            None => parse_port(value).map(SetElement::Port),
        },
    }
}

fn parse_chain(body: &Value) -> Result<Chain> {
    let name = str_field(body, "name")?.to_string();
    let chain_type = str_field(body, "type")?
        .parse()
        .map_err(|_| malformed(format!("chain '{name}' has unsupported type")))?;
    let hook = str_field(body, "hook")?
        .parse()
        .map_err(|_| malformed(format!("chain '{name}' has unsupported hook")))?;
    let prio = body
        .get("prio")
        .and_then(Value::as_i64)
        .and_then(|p| i32::try_from(p).ok())
        .unwrap_or(0);
    let policy = match body.get("policy").and_then(Value::as_str) {
        Some("drop") => Action::Drop,
        Some("accept") | None => Action::Accept,
        Some(other) => return Err(malformed(format!("chain '{name}' has policy '{other}'"))),
    };

    Ok(Chain {
        name,
        chain_type,
        hook,
        prio,
        policy,
        rules: Vec::new(),
    })
}

fn parse_rule(body: &Value) -> Result<Rule> {
    let exprs = body
        .get("expr")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("rule without 'expr'"))?;

    let mut matches = Vec::with_capacity(exprs.len());
    let mut verdict = None;

    for expr in exprs {
        let Some((key, inner)) = expr.as_object().and_then(|o| o.iter().next()) else {
            matches.push(Match::Unknown(expr.clone()));
            continue;
        };
        match key.as_str() {
            "match" => matches.push(parse_match(inner).unwrap_or_else(|| Match::Unknown(expr.clone()))),
            "accept" => verdict = Some(Verdict::Accept),
            "drop" => verdict = Some(Verdict::Drop),
            "reject" => verdict = Some(Verdict::Reject),
            "masquerade" => verdict = Some(Verdict::Masquerade),
            // Non-terminal statements do not affect the verdict
            "counter" | "log" | "limit" => {}
            _ => matches.push(Match::Unknown(expr.clone())),
        }
    }

    Ok(Rule {
        matches,
        verdict,
        comment: body.get("comment").and_then(Value::as_str).map(str::to_string),
    })
}

fn string_list(value: &Value) -> Option<Vec<&str>> {
    match value {
        Value::String(s) => Some(vec![s.as_str()]),
        Value::Array(items) => items.iter().map(Value::as_str).collect(),
        Value::Object(o) => string_list(o.get("set")?),
        _ => None,
    }
}

fn parse_match(inner: &Value) -> Option<Match> {
    let left = inner.get("left")?;
    let right = inner.get("right")?;
    let op = inner.get("op").and_then(Value::as_str).unwrap_or("==");

    if let Some(key) = left.get("meta").and_then(|m| m.get("key")).and_then(Value::as_str) {
        let negated = match op {
            "==" => false,
            "!=" => true,
            _ => return None,
        };
        return match key {
            "iifname" => Some(Match::IifName {
                pattern: right.as_str()?.to_string(),
                negated,
            }),
            "oifname" => Some(Match::OifName {
                pattern: right.as_str()?.to_string(),
                negated,
            }),
            "l4proto" if !negated => {
                let protos: Option<Vec<L4Proto>> =
                    string_list(right)?.into_iter().map(L4Proto::parse).collect();
                Some(Match::L4Proto(protos?))
            }
            _ => None,
        };
    }

    if left.get("ct").and_then(|c| c.get("key")).and_then(Value::as_str) == Some("state") {
        if !matches!(op, "==" | "in") {
            return None;
        }
        let states: Option<Vec<CtState>> =
            string_list(right)?.into_iter().map(CtState::parse).collect();
        return Some(Match::CtState(states?));
    }

    let payload = left.get("payload")?;
    if op != "==" {
        return None;
    }
    let protocol = payload.get("protocol").and_then(Value::as_str)?;
    let field = payload.get("field").and_then(Value::as_str)?;
    let set_ref = right
        .as_str()
        .and_then(|s| s.strip_prefix('@'))
        .map(str::to_string);

    match (protocol, field) {
        ("ip" | "ip6", "saddr" | "daddr") => {
            let family = if protocol == "ip" { Family::V4 } else { Family::V6 };
            let direction = if field == "saddr" {
                Direction::Source
            } else {
                Direction::Destination
            };
            let target = match set_ref {
                Some(name) => AddrTarget::Set(name),
                None => AddrTarget::Prefix(parse_prefix(right)?),
            };
            Some(Match::Addr {
                family,
                direction,
                target,
            })
        }
        ("tcp" | "udp", "dport") => {
            let protocol = if protocol == "tcp" {
                Transport::Tcp
            } else {
                Transport::Udp
            };
            let target = match set_ref {
                Some(name) => PortTarget::Set(name),
                None => match right.get("range").and_then(Value::as_array) {
                    Some(bounds) if bounds.len() == 2 => {
                        PortTarget::Range(parse_port(&bounds[0])?, parse_port(&bounds[1])?)
                    }
                    Some(_) => return None,
                    None => PortTarget::Single(parse_port(right)?),
                },
            };
            Some(Match::Dport { protocol, target })
        }
        _ => None,
    }
}
