//! Enforcement Applier: the only writer of live packet-filter state
//!
//! Apply sequence, all under the exclusive host lock:
//!
//! 1. Capture the live table and append it to the snapshot log
//! 2. Stamp the generation, pre-check the batch, write it atomically
//! 3. Read the table back and verify it
//! 4. On failure or Ctrl-C, restore the snapshot exactly once
//!
//! The host lock is a `flock` on a file in the state directory, so a second
//! invocation (or a second Applier in the same process) blocks until the
//! first one finishes. Holding a [`HostLockGuard`] is the capability that
//! [`crate::core::snapshot::restore`] requires.

use crate::audit::{AuditLog, EventType};
use crate::core::backend::NftBackend;
use crate::core::error::{Error, Result, SnapshotError};
use crate::core::policy::Policy;
use crate::core::ruleset::RuleSet;
use crate::core::snapshot::{self, DEFAULT_RETENTION, Snapshot, SnapshotLog, SnapshotRecord};
use crate::core::verify::{CheckResult, Verifier};
use crate::utils::RetryPolicy;
use nix::fcntl::{Flock, FlockArg};
use serde_json::{Value, json};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TABLE: &str = "knfw";
pub const LOCK_FILE: &str = "knfw.lock";

/// Exclusive or shared `flock` on the host lock file
#[derive(Debug, Clone)]
pub struct HostLock {
    path: PathBuf,
}

/// Proof that the host lock is held; released on drop.
pub struct HostLockGuard {
    _flock: Flock<File>,
    exclusive: bool,
}

impl std::fmt::Debug for HostLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLockGuard")
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl HostLockGuard {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl HostLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until no other holder exists.
    pub(crate) async fn exclusive(&self) -> Result<HostLockGuard> {
        self.acquire(true).await
    }

    /// Blocks while an exclusive holder exists.
    pub async fn shared(&self) -> Result<HostLockGuard> {
        self.acquire(false).await
    }

    async fn acquire(&self, exclusive: bool) -> Result<HostLockGuard> {
        let path = self.path.clone();
        debug!(exclusive, "Waiting for host lock {}", path.display());

        let flock = tokio::task::spawn_blocking(move || -> Result<Flock<File>> {
            let lock_error = |e: &dyn std::fmt::Display| Error::Lock(format!("{}: {e}", path.display()));

            if let Some(parent) = path.parent() {
                crate::utils::ensure_dir(parent).map_err(|e| lock_error(&e))?;
            }

            let mut options = std::fs::OpenOptions::new();
            options.create(true).read(true).write(true).truncate(false);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let file = options.open(&path).map_err(|e| lock_error(&e))?;

            let arg = if exclusive {
                FlockArg::LockExclusive
            } else {
                FlockArg::LockShared
            };
            Flock::lock(file, arg).map_err(|(_, errno)| lock_error(&errno))
        })
        .await
        .map_err(|e| Error::Internal(format!("lock task failed: {e}")))??;

        debug!(exclusive, "Host lock acquired");
        Ok(HostLockGuard {
            _flock: flock,
            exclusive,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum ApplyMode {
    #[default]
    #[strum(serialize = "normal")]
    Normal,
    /// First install on a host with no prior state: capture is skipped
    #[strum(serialize = "bootstrap")]
    Bootstrap,
}

/// Result of a successful apply
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub generation: u64,
    pub fingerprint: String,
    /// Pre-apply snapshot
    pub snapshot: SnapshotRecord,
    pub checks: Vec<CheckResult>,
    /// The live table already carried this content
    pub unchanged: bool,
}

enum Attempt {
    /// Nothing was committed
    Rejected(Error),
    ReadBackFailed(Error),
    Verified(Vec<CheckResult>),
    Interrupted,
}

pub struct Applier<B: NftBackend> {
    backend: B,
    log: SnapshotLog,
    verifier: Verifier,
    lock: HostLock,
    audit: AuditLog,
    table: String,
    mode: ApplyMode,
    retention: usize,
    interrupt: Arc<Notify>,
}

impl<B: NftBackend> Applier<B> {
    /// Applier with defaults: table `knfw`, lock and log under `state_dir`.
    pub fn new(backend: B, state_dir: &Path) -> Self {
        Self {
            backend,
            log: SnapshotLog::new(state_dir),
            verifier: Verifier::default(),
            lock: HostLock::new(state_dir.join(LOCK_FILE)),
            audit: AuditLog::new(state_dir),
            table: DEFAULT_TABLE.to_string(),
            mode: ApplyMode::Normal,
            retention: DEFAULT_RETENTION,
            interrupt: Arc::new(Notify::new()),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock = HostLock::new(path);
        self
    }

    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn log(&self) -> &SnapshotLog {
        &self.log
    }

    pub fn lock(&self) -> &HostLock {
        &self.lock
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Notifying this handle has the same effect as Ctrl-C during an apply.
    pub fn interrupt_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.interrupt)
    }

    /// Polls the subsystem until it answers, within `retry`.
    pub async fn wait_ready(&self, retry: RetryPolicy) -> Result<()> {
        let backend = &self.backend;
        retry
            .run("nftables", || backend.probe())
            .await
            .map_err(|e| Error::Capture(format!("subsystem not ready: {e}")))
    }

    /// Captures the live table under a shared lock.
    pub async fn capture(&self) -> Result<Snapshot> {
        let _guard = self.lock.shared().await?;
        snapshot::capture(&self.backend, &self.table).await
    }

    fn next_generation(&self, snapshot: &Snapshot, ruleset: &RuleSet) -> Result<(u64, bool)> {
        if let (Some(live_fp), Some(live_gen)) = (&snapshot.fingerprint, snapshot.generation)
            && *live_fp == ruleset.fingerprint
        {
            return Ok((live_gen, true));
        }
        let persisted = self.log.read_generation()?;
        let live = snapshot.generation.unwrap_or(0);
        Ok((persisted.max(live).saturating_add(1), false))
    }

    /// Replaces the live table with `ruleset` and verifies it.
    ///
    /// # Errors
    ///
    /// - `Error::Capture` if the pre-apply snapshot cannot be taken (nothing changed)
    /// - `Error::VerificationFailed` if checks failed, or the table could not be
    ///   read back, and the snapshot was restored
    /// - `Error::Restore` if the automatic restore failed as well; carries the
    ///   failed checks
    /// - `Error::Interrupted` on Ctrl-C, once any in-flight write has finished
    pub async fn apply(&self, policy: &Policy, ruleset: RuleSet) -> Result<ApplyOutcome> {
        let guard = self.lock.exclusive().await?;

        let snapshot = match self.mode {
            ApplyMode::Normal => snapshot::capture(&self.backend, &self.table).await?,
            ApplyMode::Bootstrap => {
                info!("Bootstrap mode: skipping capture, recording absent prior state");
                Snapshot::absent(&self.table)
            }
        };
        let record = self.log.append(&snapshot)?;

        let (generation, unchanged) = self.next_generation(&snapshot, &ruleset)?;
        let ruleset = ruleset.with_generation(generation);
        let batch = ruleset.to_nftables_json();
        info!(
            generation,
            fingerprint = %ruleset.fingerprint,
            rules = ruleset.rule_count(),
            unchanged,
            "Applying rule set to table inet {}",
            self.table
        );

        let check = self.backend.check(&batch).await?;
        if !check.success {
            let message = check.errors.join("; ");
            error!("Pre-check rejected the batch: {message}");
            self.audit
                .record(
                    EventType::Apply,
                    false,
                    json!({ "generation": generation, "stage": "check" }),
                    Some(message.clone()),
                )
                .await;
            return Err(Error::Nftables {
                message,
                stderr: None,
                exit_code: None,
            });
        }

        let interrupt = Arc::clone(&self.interrupt);
        let attempt = self.write_and_verify(policy, &batch, &interrupt).await;

        match attempt {
            Attempt::Verified(checks) if checks.iter().all(|c| c.passed) => {
                self.finish(generation, &ruleset, record, checks, unchanged)
                    .await
            }
            Attempt::Verified(checks) => {
                let failures: Vec<CheckResult> = checks.into_iter().filter(|c| !c.passed).collect();
                warn!(generation, failed = failures.len(), "Verification failed, restoring snapshot");
                self.fail_verification(&guard, &record, generation, failures)
                    .await
            }
            Attempt::ReadBackFailed(e) => {
                error!("Reading back the applied table failed: {e}");
                let failure = CheckResult::read_back(&self.table, &e);
                self.fail_verification(&guard, &record, generation, vec![failure])
                    .await
            }
            Attempt::Rejected(e) => {
                self.audit
                    .record(
                        EventType::Apply,
                        false,
                        json!({ "generation": generation, "stage": "write" }),
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
            Attempt::Interrupted => {
                warn!("Apply interrupted, restoring snapshot");
                let restored = self.revert(&guard, &record).await.is_ok();
                self.audit
                    .record(
                        EventType::Interrupted,
                        restored,
                        json!({ "generation": generation, "snapshot": record.name }),
                        None,
                    )
                    .await;
                Err(Error::Interrupted { restored })
            }
        }
    }

    /// Writes `batch`, reads the table back and verifies it.
    ///
    /// An interrupt never cancels the write; it takes effect once the write
    /// returns. Read-back and verification are abandoned at once.
    async fn write_and_verify(&self, policy: &Policy, batch: &Value, interrupt: &Notify) -> Attempt {
        let write = self.backend.write(batch);
        tokio::pin!(write);
        let mut interrupted = false;
        let written = loop {
            tokio::select! {
                biased;
                written = &mut write => break written,
                Ok(()) = tokio::signal::ctrl_c(), if !interrupted => {
                    warn!("Interrupt received; waiting for the in-flight write to finish");
                    interrupted = true;
                }
                () = interrupt.notified(), if !interrupted => {
                    warn!("Interrupt received; waiting for the in-flight write to finish");
                    interrupted = true;
                }
            }
        };

        if let Err(e) = written {
            return Attempt::Rejected(e);
        }
        if interrupted {
            return Attempt::Interrupted;
        }

        tokio::select! {
            biased;
            Ok(()) = tokio::signal::ctrl_c() => Attempt::Interrupted,
            () = interrupt.notified() => Attempt::Interrupted,
            attempt = self.read_back_and_verify(policy) => attempt,
        }
    }

    async fn read_back_and_verify(&self, policy: &Policy) -> Attempt {
        let live = match self.backend.list_table(&self.table).await {
            Ok(Some(listing)) => match RuleSet::from_nftables_json(&listing, &self.table) {
                Ok(live) => live,
                Err(e) => return Attempt::ReadBackFailed(e),
            },
            Ok(None) => {
                return Attempt::ReadBackFailed(Error::Internal(format!(
                    "table inet {} missing after write",
                    self.table
                )));
            }
            Err(e) => return Attempt::ReadBackFailed(e),
        };

        Attempt::Verified(self.verifier.verify(policy, &live).await)
    }

    /// Records the failed checks, then restores the pre-apply snapshot once.
    async fn fail_verification(
        &self,
        guard: &HostLockGuard,
        record: &SnapshotRecord,
        generation: u64,
        failures: Vec<CheckResult>,
    ) -> Result<ApplyOutcome> {
        self.audit
            .record(
                EventType::VerificationFailed,
                false,
                json!({ "generation": generation, "failures": failures, "snapshot": record.name }),
                None,
            )
            .await;

        match self.revert(guard, record).await {
            Ok(()) => Err(Error::VerificationFailed {
                generation,
                failures,
            }),
            Err(Error::Restore {
                table,
                snapshot,
                message,
                ..
            }) => Err(Error::Restore {
                table,
                snapshot,
                message,
                failures,
            }),
            Err(e) => Err(e),
        }
    }

    async fn finish(
        &self,
        generation: u64,
        ruleset: &RuleSet,
        record: SnapshotRecord,
        checks: Vec<CheckResult>,
        unchanged: bool,
    ) -> Result<ApplyOutcome> {
        self.log.write_generation(generation)?;

        match self.log.prune(self.retention, &[record.name.as_str()]) {
            Ok(removed) if !removed.is_empty() => debug!("Pruned {} snapshot(s)", removed.len()),
            Ok(_) => {}
            Err(e) => warn!("Snapshot pruning failed: {e}"),
        }

        self.audit
            .record(
                EventType::Apply,
                true,
                json!({
                    "table": self.table,
                    "generation": generation,
                    "fingerprint": ruleset.fingerprint,
                    "rule_count": ruleset.rule_count(),
                    "snapshot": record.name,
                    "unchanged": unchanged,
                }),
                None,
            )
            .await;

        info!(generation, checks = checks.len(), "Apply verified");
        Ok(ApplyOutcome {
            generation,
            fingerprint: ruleset.fingerprint.clone(),
            snapshot: record,
            checks,
            unchanged,
        })
    }

    async fn revert(&self, guard: &HostLockGuard, record: &SnapshotRecord) -> Result<()> {
        let result = snapshot::restore(guard, &self.backend, &record.snapshot, &record.path).await;
        self.audit
            .record(
                EventType::RestoreSnapshot,
                result.is_ok(),
                json!({ "snapshot": record.name }),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        result
    }

    /// Restores the newest snapshot, or the one named `name`.
    pub async fn rollback(&self, name: Option<&str>) -> Result<SnapshotRecord> {
        let guard = self.lock.exclusive().await?;

        let record = match name {
            Some(name) => self.log.load(name)?,
            None => self
                .log
                .latest()?
                .ok_or_else(|| SnapshotError::NotFound("no snapshots recorded".to_string()))?,
        };

        let result = snapshot::restore(&guard, &self.backend, &record.snapshot, &record.path).await;
        self.audit
            .record(
                EventType::Rollback,
                result.is_ok(),
                json!({ "snapshot": record.name, "generation": record.snapshot.generation }),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        result?;

        info!("Rolled back to {}", record.name);
        Ok(record)
    }

    /// Records `snapshot` in the log and restores it.
    pub async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotRecord> {
        let guard = self.lock.exclusive().await?;
        let record = self.log.append(snapshot)?;
        self.revert(&guard, &record).await?;
        Ok(record)
    }
}
