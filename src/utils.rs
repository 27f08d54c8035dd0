//! Utility functions for directory management and system integration
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and state storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Config: `~/.config/knfw/` - Engine configuration (`config.json`)
//! - State: `~/.local/state/knfw/` - Snapshots, generation, audit log, lock file
//!
//! When running as root without a home-based XDG layout, `/var/lib/knfw` is used
//! for state.
//!
//! # Example
//!
//! ```
//! use knfw::utils::{matches_pattern, RetryPolicy};
//! use std::time::Duration;
//!
//! assert!(matches_pattern("veth*", "veth1a2b"));
//! assert!(!matches_pattern("cni0", "cni1"));
//!
//! let retry = RetryPolicy::within(Duration::from_secs(10));
//! assert!(retry.max_attempts >= 10);
//! ```

use crate::core::error::{Error, Result};
use directories::ProjectDirs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// System-wide state directory used when XDG state is unavailable
pub const SYSTEM_STATE_DIR: &str = "/var/lib/knfw";

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("io", "knfw", "knfw").map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("io", "knfw", "knfw")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// State directory with the system fallback applied
pub fn default_state_dir() -> PathBuf {
    if nix::unistd::getuid().is_root() {
        return PathBuf::from(SYSTEM_STATE_DIR);
    }
    get_state_dir().unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
}

/// Creates `dir` (and parents) with mode 0700.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }

    Ok(())
}

/// Interface names found under `<root>/sys/class/net`, sorted.
pub fn list_interfaces(root: &Path) -> Vec<String> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root.join("sys/class/net")) {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                interfaces.push(name);
            }
        }
    }
    interfaces.sort();
    interfaces
}

/// nftables interface name matching: a trailing `*` matches any suffix.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(stem) => name.starts_with(stem),
        None => pattern == name,
    }
}

/// Bounded retry for waiting on dependencies outside the engine's control.
///
/// Never used for the apply/verify/rollback sequence itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Polls once per second for roughly `total`.
    pub fn within(total: Duration) -> Self {
        let attempts = u32::try_from(total.as_secs()).unwrap_or(u32::MAX).saturating_add(1);
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
        }
    }

    /// Delay before attempt `attempt + 1` (exponential, capped)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Runs `op` until it succeeds or attempts run out; returns the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{what} ready after {} attempt(s)", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt + 1 < attempts {
                        let delay = self.delay_for(attempt);
                        warn!("{what} not ready ({e}), retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal(format!("{what}: no attempts made"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("veth*", "veth"));
        assert!(matches_pattern("veth*", "vethabc"));
        assert!(matches_pattern("flannel.1", "flannel.1"));
        assert!(!matches_pattern("flannel.1", "flannel.10"));
        assert!(!matches_pattern("cni*", "eth0"));
        assert!(!matches_pattern("lo", ""));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
        assert_eq!(policy.delay_for(40), Duration::from_secs(4));
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast()
            .run("nft", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Capture("not yet".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..fast()
        };
        let counter = &calls;
        let result: Result<()> = policy
            .run("nft", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Capture("down".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Capture(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_list_interfaces_under_root() {
        let root = tempfile::tempdir().unwrap();
        let net = root.path().join("sys/class/net");
        std::fs::create_dir_all(net.join("eth0")).unwrap();
        std::fs::create_dir_all(net.join("cni0")).unwrap();
        assert_eq!(list_interfaces(root.path()), vec!["cni0", "eth0"]);
    }
}
