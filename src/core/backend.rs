//! Read/check/write seam to the packet-filter subsystem
//!
//! [`NftBackend`] is implemented by [`crate::core::nft::NftCli`] for the real
//! host and by [`MemoryBackend`], an in-memory nftables emulation used for
//! `--dry-run` and tests. Only the Applier and the Snapshotter's restore path
//! call [`NftBackend::write`].

use crate::core::error::{Error, Result};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Result of a ruleset verification operation (`nft --check`)
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Creates a successful verification result
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    /// Creates a failed verification result with errors
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

pub trait NftBackend: Send + Sync {
    /// `nft -j list table inet <table>`; `Ok(None)` when the table does not exist.
    fn list_table(&self, table: &str) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// Dry-run a batch without committing it.
    fn check(&self, batch: &Value) -> impl Future<Output = Result<VerifyResult>> + Send;

    /// Commits a batch as one atomic transaction.
    fn write(&self, batch: &Value) -> impl Future<Output = Result<()>> + Send;

    /// Succeeds when the subsystem answers at all.
    fn probe(&self) -> impl Future<Output = Result<()>> + Send;
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory emulation
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
struct TableState {
    handle: u64,
    comment: Option<String>,
    next_handle: u64,
    sets: Vec<Value>,
    chains: Vec<Value>,
    rules: Vec<Value>,
}

impl TableState {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Debug, Clone, Default)]
struct Kernel {
    tables: BTreeMap<String, TableState>,
    next_table_handle: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    kernel: Kernel,
    unreachable: bool,
    /// Writes beyond this many successful ones are rejected
    write_budget: Option<usize>,
    writes: usize,
    /// Listings beyond this many successful ones fail
    read_budget: Option<usize>,
    reads: usize,
}

/// In-memory nftables emulation supporting the subset of commands this crate emits.
///
/// Batches are applied to a copy of the state and committed only if every
/// command succeeds, like a kernel transaction. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

const ENOENT: &str = "Could not process rule: No such file or directory";
const UNREACHABLE: &str = "netlink: Error: cache initialization failed: Protocol not supported";

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned emulator is still consistent: batches commit by swap
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Simulates a missing kernel module / unreachable subsystem.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Rejects every write after `successful` more writes have committed.
    pub fn fail_writes_after(&self, successful: usize) {
        let mut state = self.lock();
        state.write_budget = Some(state.writes + successful);
    }

    /// Fails every `list_table` after `successful` more listings.
    pub fn fail_reads_after(&self, successful: usize) {
        let mut state = self.lock();
        state.read_budget = Some(state.reads + successful);
    }

    /// Number of committed writes
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn unreachable_error() -> Error {
        Error::Nftables {
            message: UNREACHABLE.to_string(),
            stderr: Some(UNREACHABLE.to_string()),
            exit_code: Some(1),
        }
    }

    fn rejected(message: impl Into<String>) -> Error {
        let message = message.into();
        Error::Nftables {
            stderr: Some(format!("Error: {message}")),
            message,
            exit_code: Some(1),
        }
    }

    fn listing(kernel: &Kernel, table: &str) -> Option<Value> {
        let state = kernel.tables.get(table)?;

        let mut table_obj = json!({ "family": "inet", "name": table, "handle": state.handle });
        if let Some(ref comment) = state.comment {
            table_obj["comment"] = json!(comment);
        }

        let mut items = vec![
            json!({ "metainfo": { "version": "memory", "release_name": "in-memory", "json_schema_version": 1 } }),
            json!({ "table": table_obj }),
        ];
        items.extend(state.sets.iter().map(|s| json!({ "set": s })));
        items.extend(state.chains.iter().map(|c| json!({ "chain": c })));
        items.extend(state.rules.iter().map(|r| json!({ "rule": r })));

        Some(json!({ "nftables": items }))
    }
}

fn name_of<'a>(body: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    body.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("Could not process rule: missing '{key}'"))
}

fn with_handle(body: &Value, handle: u64) -> Value {
    let mut obj: Map<String, Value> = body.as_object().cloned().unwrap_or_default();
    obj.insert("handle".into(), json!(handle));
    Value::Object(obj)
}

fn same_name(existing: &Value, name: &str) -> bool {
    existing.get("name").and_then(Value::as_str) == Some(name)
}

fn execute(kernel: &mut Kernel, batch: &Value) -> std::result::Result<(), String> {
    let items = batch
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or("JSON syntax error: missing 'nftables' array")?;

    for item in items {
        let Some((command, object)) = item.as_object().and_then(|o| o.iter().next()) else {
            return Err("JSON syntax error: empty command".into());
        };
        if command == "metainfo" {
            continue;
        }
        let Some((kind, body)) = object.as_object().and_then(|o| o.iter().next()) else {
            return Err(format!("JSON syntax error: malformed '{command}' command"));
        };

        if body.get("family").and_then(Value::as_str).is_some_and(|f| f != "inet") {
            return Err("Could not process rule: only the inet family is emulated".into());
        }

        match (command.as_str(), kind.as_str()) {
            ("add" | "create", "table") => {
                let name = name_of(body, "name")?;
                let comment = body.get("comment").and_then(Value::as_str).map(str::to_string);
                if let Some(existing) = kernel.tables.get_mut(name) {
                    if command == "create" {
                        return Err("Could not process rule: File exists".into());
                    }
                    if comment.is_some() {
                        existing.comment = comment;
                    }
                } else {
                    kernel.next_table_handle += 1;
                    kernel.tables.insert(
                        name.to_string(),
                        TableState {
                            handle: kernel.next_table_handle,
                            comment,
                            ..TableState::default()
                        },
                    );
                }
            }
            ("delete", "table") => {
                let name = name_of(body, "name")?;
                if kernel.tables.remove(name).is_none() {
                    return Err(ENOENT.into());
                }
            }
            ("flush", "table") => {
                let name = name_of(body, "name")?;
                let table = kernel.tables.get_mut(name).ok_or(ENOENT)?;
                table.rules.clear();
            }
            ("add" | "create", "set") => {
                let table = kernel.tables.get_mut(name_of(body, "table")?).ok_or(ENOENT)?;
                let name = name_of(body, "name")?;
                name_of(body, "type")?;
                if table.sets.iter().any(|s| same_name(s, name)) {
                    if command == "create" {
                        return Err("Could not process rule: File exists".into());
                    }
                } else {
                    let handle = table.alloc_handle();
                    table.sets.push(with_handle(body, handle));
                }
            }
            ("add" | "create", "chain") => {
                let table = kernel.tables.get_mut(name_of(body, "table")?).ok_or(ENOENT)?;
                let name = name_of(body, "name")?;
                if !table.chains.iter().any(|c| same_name(c, name)) {
                    let handle = table.alloc_handle();
                    table.chains.push(with_handle(body, handle));
                }
            }
            ("add", "rule") => {
                let table = kernel.tables.get_mut(name_of(body, "table")?).ok_or(ENOENT)?;
                let chain = name_of(body, "chain")?;
                if !table.chains.iter().any(|c| same_name(c, chain)) {
                    return Err(ENOENT.into());
                }
                if body.get("expr").and_then(Value::as_array).is_none() {
                    return Err("Could not process rule: rule without expressions".into());
                }
                let handle = table.alloc_handle();
                table.rules.push(with_handle(body, handle));
            }
            (command, kind) => {
                return Err(format!("Could not process rule: unsupported '{command} {kind}'"));
            }
        }
    }

    Ok(())
}

impl NftBackend for MemoryBackend {
    async fn list_table(&self, table: &str) -> Result<Option<Value>> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        if state.read_budget.is_some_and(|budget| state.reads >= budget) {
            return Err(Error::Nftables {
                message: "netlink: Error: list table: Interrupted system call".to_string(),
                stderr: None,
                exit_code: Some(1),
            });
        }
        state.reads += 1;
        Ok(Self::listing(&state.kernel, table))
    }

    async fn check(&self, batch: &Value) -> Result<VerifyResult> {
        let state = self.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        let mut scratch = state.kernel.clone();
        Ok(match execute(&mut scratch, batch) {
            Ok(()) => VerifyResult::success(),
            Err(e) => VerifyResult::failure(vec![e]),
        })
    }

    async fn write(&self, batch: &Value) -> Result<()> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(Self::unreachable_error());
        }
        if state.write_budget.is_some_and(|budget| state.writes >= budget) {
            return Err(Self::rejected("Could not process rule: Operation not permitted"));
        }

        let mut scratch = state.kernel.clone();
        execute(&mut scratch, batch).map_err(Self::rejected)?;
        state.kernel = scratch;
        state.writes += 1;
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        if self.lock().unreachable {
            return Err(Self::unreachable_error());
        }
        Ok(())
    }
}
