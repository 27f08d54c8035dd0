//! Pre-apply snapshots of the owned table and the bounded snapshot log
//!
//! A snapshot is the verbatim `nft -j list table` output (or a record that the
//! table was absent). It is written to disk before every apply so that a hard
//! kill never loses the last known-good state.
//!
//! # Layout
//!
//! ```text
//! <state_dir>/
//!   generation                                  last applied generation
//!   snapshots/
//!     snapshot_20250101T120000.000000Z_000001.json
//!     snapshot_20250101T120000.000000Z_000001.json.sha256
//! ```

use crate::core::backend::NftBackend;
use crate::core::enforce::HostLockGuard;
use crate::core::error::{Error, Result, SnapshotError};
use crate::core::ruleset::{FAMILY, RuleSet, TableStamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// On-disk snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Default number of snapshots kept by the log
pub const DEFAULT_RETENTION: usize = 5;

const SNAPSHOT_PREFIX: &str = "snapshot_";
const SNAPSHOT_SUFFIX: &str = ".json";
const CHECKSUM_SUFFIX: &str = ".sha256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub version: u32,
    pub captured_at: DateTime<Utc>,
    pub table: String,
    pub generation: Option<u64>,
    pub fingerprint: Option<String>,
    /// Verbatim `nft -j list table` output; `None` when the table did not exist
    pub ruleset: Option<Value>,
}

impl Snapshot {
    /// "No prior state" snapshot
    pub fn absent(table: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            captured_at: Utc::now(),
            table: table.into(),
            generation: None,
            fingerprint: None,
            ruleset: None,
        }
    }

    fn from_listing(table: &str, listing: Value) -> Result<Self> {
        let table_obj = find_table(&listing, table).ok_or_else(|| {
            SnapshotError::Corrupted(format!("listing does not contain table {FAMILY} {table}"))
        })?;
        let stamp = table_obj
            .get("comment")
            .and_then(Value::as_str)
            .and_then(TableStamp::parse);
        // Content fingerprint; a table we cannot parse never matches a compiled one
        let fingerprint = match RuleSet::from_nftables_json(&listing, table) {
            Ok(live) => Some(live.fingerprint),
            Err(e) => {
                debug!("Captured table is not parseable: {e}");
                None
            }
        };

        Ok(Self {
            version: SNAPSHOT_FORMAT_VERSION,
            captured_at: Utc::now(),
            table: table.to_string(),
            generation: stamp.and_then(|s| s.generation),
            fingerprint,
            ruleset: Some(listing),
        })
    }

    pub fn is_absent(&self) -> bool {
        self.ruleset.is_none()
    }

    /// Typed view of the captured table; `Ok(None)` for an absent snapshot.
    pub fn rule_set(&self) -> Result<Option<RuleSet>> {
        self.ruleset
            .as_ref()
            .map(|listing| RuleSet::from_nftables_json(listing, &self.table))
            .transpose()
    }

    /// Listing without kernel-assigned handles and metainfo, for comparisons.
    pub fn normalized(&self) -> Option<Value> {
        let listing = self.ruleset.as_ref()?;
        let items: Vec<Value> = listing
            .get("nftables")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.get("metainfo").is_none())
                    .map(strip_handle)
                    .collect()
            })
            .unwrap_or_default();
        Some(json!({ "nftables": items }))
    }

    /// nftables batch that recreates exactly the captured table.
    ///
    /// Usable offline: `knfw snapshots show NAME --batch | nft -j -f -`.
    pub fn restore_batch(&self) -> Result<Value> {
        let bare = json!({ "family": FAMILY, "name": self.table });
        let mut batch = vec![json!({ "add": { "table": bare } }), json!({ "delete": { "table": bare } })];

        let Some(ref listing) = self.ruleset else {
            return Ok(json!({ "nftables": batch }));
        };

        let items = listing
            .get("nftables")
            .and_then(Value::as_array)
            .ok_or_else(|| SnapshotError::Corrupted("missing 'nftables' array".into()))?;

        let table_obj = find_table(listing, &self.table).ok_or_else(|| {
            SnapshotError::Corrupted(format!("listing does not contain table {FAMILY} {}", self.table))
        })?;
        batch.push(json!({ "add": { "table": strip_handle_object(table_obj) } }));

        // Rules reference sets and chains, so they go last
        for kind in ["set", "chain", "rule"] {
            for item in items {
                if let Some(body) = item.get(kind) {
                    batch.push(json!({ "add": { kind: strip_handle_object(body) } }));
                }
            }
        }

        Ok(json!({ "nftables": batch }))
    }
}

fn find_table<'a>(listing: &'a Value, table: &str) -> Option<&'a Value> {
    listing
        .get("nftables")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("table"))
        .find(|t| {
            t.get("name").and_then(Value::as_str) == Some(table)
                && t.get("family").and_then(Value::as_str).is_none_or(|f| f == FAMILY)
        })
}

fn strip_handle_object(body: &Value) -> Value {
    let mut body = body.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.remove("handle");
    }
    body
}

fn strip_handle(item: &Value) -> Value {
    match item.as_object() {
        Some(obj) if obj.len() == 1 => {
            let (kind, body) = obj.iter().next().map(|(k, v)| (k.clone(), v)).unwrap_or_default();
            json!({ kind: strip_handle_object(body) })
        }
        _ => item.clone(),
    }
}

/// Reads the live table into a snapshot.
///
/// # Errors
///
/// `Error::Capture` if the packet-filter subsystem cannot be queried.
pub async fn capture<B: NftBackend>(backend: &B, table: &str) -> Result<Snapshot> {
    let listing = backend.list_table(table).await.map_err(|e| {
        error!("Capture of table {FAMILY} {table} failed: {e}");
        Error::Capture(e.to_string())
    })?;

    match listing {
        None => {
            debug!("Table {FAMILY} {table} absent; capturing empty state");
            Ok(Snapshot::absent(table))
        }
        Some(listing) => Snapshot::from_listing(table, listing)
            .map_err(|e| Error::Capture(format!("unexpected listing: {e}"))),
    }
}

/// Replaces the live table with the snapshot's contents in one atomic batch.
///
/// Requires the host lock token, which only the Applier hands out.
/// `origin` names the snapshot file for recovery instructions.
///
/// # Errors
///
/// `Error::Restore` if the snapshot is malformed or the subsystem rejects it.
pub async fn restore<B: NftBackend>(
    _lock: &HostLockGuard,
    backend: &B,
    snapshot: &Snapshot,
    origin: &Path,
) -> Result<()> {
    let restore_error = |message: String| {
        error!("Restore from {} failed: {message}", origin.display());
        Error::Restore {
            table: snapshot.table.clone(),
            snapshot: origin.to_path_buf(),
            message,
            failures: Vec::new(),
        }
    };

    let batch = snapshot
        .restore_batch()
        .map_err(|e| restore_error(e.to_string()))?;

    let check = backend
        .check(&batch)
        .await
        .map_err(|e| restore_error(e.to_string()))?;
    if !check.success {
        return Err(restore_error(check.errors.join("; ")));
    }

    backend
        .write(&batch)
        .await
        .map_err(|e| restore_error(e.to_string()))?;

    info!(
        generation = ?snapshot.generation,
        absent = snapshot.is_absent(),
        "Restored snapshot {}",
        origin.display()
    );
    Ok(())
}

/// Computes SHA-256 checksum of raw bytes.
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A snapshot as stored in the log
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub name: String,
    pub path: PathBuf,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub name: String,
    pub path: PathBuf,
    pub seq: u64,
}

/// Bounded, ordered on-disk snapshot log plus the persisted generation
#[derive(Debug, Clone)]
pub struct SnapshotLog {
    state_dir: PathBuf,
}

impl SnapshotLog {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    fn generation_path(&self) -> PathBuf {
        self.state_dir.join("generation")
    }

    /// Writes `snapshot` and its checksum sidecar.
    pub fn append(&self, snapshot: &Snapshot) -> Result<SnapshotRecord> {
        let dir = self.dir();
        crate::utils::ensure_dir(&dir)?;

        let seq = self.list()?.first().map_or(1, |e| e.seq + 1);
        let timestamp = snapshot.captured_at.format("%Y%m%dT%H%M%S%.6fZ");
        let name = format!("{SNAPSHOT_PREFIX}{timestamp}_{seq:06}{SNAPSHOT_SUFFIX}");
        let path = dir.join(&name);

        let json_string = serde_json::to_string_pretty(snapshot)?;
        let checksum = compute_checksum(json_string.as_bytes());

        write_atomic(&dir, &path, json_string.as_bytes())?;
        write_atomic(&dir, &checksum_path(&path), checksum.as_bytes())?;

        info!("Snapshot saved to {:?}", path);

        Ok(SnapshotRecord {
            name,
            path,
            snapshot: snapshot.clone(),
        })
    }

    /// All snapshots, newest first
    pub fn list(&self) -> Result<Vec<SnapshotEntry>> {
        let dir = self.dir();
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<SnapshotEntry> = read_dir
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let seq = parse_seq(&name)?;
                Some(SnapshotEntry {
                    path: entry.path(),
                    name,
                    seq,
                })
            })
            .collect();

        entries.sort_by(|a, b| b.seq.cmp(&a.seq).then_with(|| b.name.cmp(&a.name)));
        Ok(entries)
    }

    /// The most recent snapshot ("last known good"), if any
    pub fn latest(&self) -> Result<Option<SnapshotRecord>> {
        match self.list()?.first() {
            Some(entry) => self.load(&entry.name).map(Some),
            None => Ok(None),
        }
    }

    /// Loads a snapshot by file name, verifying its checksum.
    pub fn load(&self, name: &str) -> Result<SnapshotRecord> {
        let name = if name.ends_with(SNAPSHOT_SUFFIX) {
            name.to_string()
        } else {
            format!("{name}{SNAPSHOT_SUFFIX}")
        };
        if parse_seq(&name).is_none() || name.contains('/') {
            return Err(SnapshotError::NotFound(name).into());
        }

        let path = self.dir().join(&name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(name).into());
            }
            Err(e) => return Err(e.into()),
        };

        let expected = std::fs::read_to_string(checksum_path(&path))
            .map_err(|_| SnapshotError::Corrupted(format!("{name}: checksum file missing")))?;
        let expected = expected.trim().to_string();
        let actual = compute_checksum(&bytes);
        if expected != actual {
            warn!("Checksum mismatch for snapshot {name}");
            return Err(SnapshotError::ChecksumMismatch { expected, actual }.into());
        }

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| SnapshotError::Corrupted(format!("{name}: {e}")))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: snapshot.version,
                expected: SNAPSHOT_FORMAT_VERSION,
            }
            .into());
        }

        Ok(SnapshotRecord {
            name,
            path,
            snapshot,
        })
    }

    /// Deletes all but the newest `keep` snapshots, never touching `pinned`.
    ///
    /// Returns the names that were removed.
    pub fn prune(&self, keep: usize, pinned: &[&str]) -> Result<Vec<String>> {
        let mut removed = Vec::new();

        for entry in self.list()?.into_iter().skip(keep) {
            if pinned.contains(&entry.name.as_str()) {
                debug!("Keeping pinned snapshot {}", entry.name);
                continue;
            }
            if let Err(e) = std::fs::remove_file(&entry.path) {
                warn!("Failed to remove old snapshot {:?}: {}", entry.path, e);
                continue;
            }
            let _ = std::fs::remove_file(checksum_path(&entry.path));
            info!("Removed old snapshot: {:?}", entry.path);
            removed.push(entry.name);
        }

        Ok(removed)
    }

    /// Last successfully applied generation; 0 if none was ever recorded.
    pub fn read_generation(&self) -> Result<u64> {
        match std::fs::read_to_string(self.generation_path()) {
            Ok(text) => text.trim().parse().map_err(|_| {
                SnapshotError::Corrupted(format!("generation file contains '{}'", text.trim())).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_generation(&self, generation: u64) -> Result<()> {
        crate::utils::ensure_dir(&self.state_dir)?;
        write_atomic(
            &self.state_dir,
            &self.generation_path(),
            format!("{generation}\n").as_bytes(),
        )
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(CHECKSUM_SUFFIX);
    PathBuf::from(os)
}

fn parse_seq(name: &str) -> Option<u64> {
    let stem = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
    stem.rsplit_once('_')?.1.parse().ok()
}

/// temp file in the same directory → fsync → rename, mode 0600
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
