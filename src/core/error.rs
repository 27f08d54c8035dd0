use crate::core::verify::CheckResult;
use std::path::PathBuf;
use thiserror::Error;

/// Core error types for knfw
#[derive(Debug, Error)]
pub enum Error {
    /// Policy document failed validation. Live state was never touched.
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// A CIDR entry could not be parsed as a network prefix
    #[error("Malformed CIDR in {field}: '{value}' ({reason})")]
    MalformedCidr {
        field: String,
        value: String,
        reason: String,
    },

    /// The pre-apply snapshot could not be taken; apply aborted before any mutation
    #[error("Capture failed: {0}")]
    Capture(String),

    /// New rules were written, failed verification, and were reverted
    #[error("Verification failed for generation {generation}: {} check(s) failed", .failures.len())]
    VerificationFailed {
        generation: u64,
        failures: Vec<CheckResult>,
    },

    /// Automatic revert failed; live state is unknown.
    ///
    /// `failures` holds the checks that triggered the revert, if any.
    #[error("Restore of table inet {table} from {} failed: {message}", .snapshot.display())]
    Restore {
        table: String,
        snapshot: PathBuf,
        message: String,
        failures: Vec<CheckResult>,
    },

    /// Operator aborted an in-flight apply
    #[error("Apply interrupted (previous rules restored: {restored})")]
    Interrupted { restored: bool },

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Host firewall lock could not be taken
    #[error("Lock error: {0}")]
    Lock(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Process exit code for the command surface.
    ///
    /// - `1`: policy validation error
    /// - `2`: verification failed (or interrupted) and rollback succeeded
    /// - `3`: rollback failed, manual intervention required
    /// - `4`: capture/restore subsystem unreachable
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Validation { .. } | Error::MalformedCidr { .. } | Error::Internal(_) => 1,
            Error::VerificationFailed { .. } | Error::Interrupted { restored: true } => 2,
            Error::Restore { .. } | Error::Interrupted { restored: false } => 3,
            Error::Capture(_)
            | Error::Nftables { .. }
            | Error::Snapshot(_)
            | Error::Lock(_)
            | Error::Elevation(_)
            | Error::Io(_) => 4,
            Error::Serialization(_) => 1,
        }
    }

    /// Manual recovery instructions for the severe case, if any.
    pub fn recovery_instructions(&self) -> Option<String> {
        match self {
            Error::Restore { table, snapshot, .. } => {
                let name = snapshot
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("<snapshot>");
                Some(format!(
                    "Live firewall state is UNKNOWN. Do not re-run apply.\n\
                     1. Inspect the live table:   nft list table inet {table}\n\
                     2. Restore manually:         knfw rollback {name}\n\
                     3. If knfw cannot run:       knfw snapshots show {name} --batch | nft -j -f -\n\
                     Snapshot file: {}",
                    snapshot.display()
                ))
            }
            Error::Interrupted { restored: false } => Some(
                "Apply was interrupted and the previous rules could not be restored. \
                 Run `knfw rollback` to restore the most recent snapshot."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot corrupted: {0}")]
    Corrupted(String),

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns an operator-facing translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run knfw as root or allow sudo for nft")
                .with_suggestion("Check that CAP_NET_ADMIN is available in this context");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("Set KNFW_ELEVATION_METHOD=sudo or run as root");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or point KNFW_NFT_COMMAND at the nft binary");
        }

        if lower.contains("netlink") || lower.contains("protocol not supported") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: modprobe nf_tables");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nftables rejected the generated rule set")
                .with_suggestion("Run `knfw compile POLICY --format json` and inspect the batch")
                .with_suggestion("Check that nft_masq/nf_nat are available when NAT rules are used");
        }

        if lower.contains("interval overlaps") || lower.contains("conflicting intervals") {
            return ErrorTranslation::new("Overlapping prefixes in a CIDR set")
                .with_suggestion("Upgrade nftables (auto-merge requires nft >= 0.9.2)");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion(
                    "Check for conflicting firewall managers: systemctl status firewalld ufw",
                );
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Run `knfw diagnose POLICY` for a ranked list of likely causes")
            .with_suggestion("Verify nftables is working: nft list ruleset")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
