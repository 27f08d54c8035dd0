//! Privilege elevation for nftables operations
//!
//! knfw is usually invoked as root by the node's provisioning tooling. When it
//! is not, only the `nft` binary is elevated, never the whole process.
//!
//! # Elevation Strategy
//!
//! 1. `KNFW_TEST_NO_ELEVATION` set: run `nft` directly (tests only)
//! 2. Already root: run `nft` directly
//! 3. `KNFW_ELEVATION_METHOD` set: use exactly that method (`sudo` or `run0`)
//! 4. `run0` when available (systemd v256+, no SUID)
//! 5. `sudo`
//!
//! # Environment Variables
//!
//! - `KNFW_NFT_COMMAND`: path of the `nft` binary to run (defaults to the
//!   build-time `KNFW_SYSTEM_NFT_PATH`, or `nft` from `PATH`).
//! - `KNFW_ELEVATION_METHOD`: force `sudo` or `run0`. Useful with sudoers
//!   NOPASSWD rules on provisioning hosts.
//! - `KNFW_TEST_NO_ELEVATION`: bypass elevation entirely.
//!
//! # Example
//!
//! ```no_run
//! use knfw::elevation::create_elevated_nft_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_nft_command(&["-j", "list", "table", "inet", "knfw"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use tokio::process::Command;

/// nft binary baked in at build time, overridable by packagers
pub const DEFAULT_NFT_PATH: &str = match option_env!("KNFW_SYSTEM_NFT_PATH") {
    Some(path) => path,
    None => "nft",
};

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Neither run0 nor sudo could be found
    #[error("No elevation method available: run knfw as root, or install sudo")]
    NoMethodAvailable,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `KNFW_ELEVATION_METHOD`
    #[error("Invalid KNFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// The nft program to execute
pub fn nft_program() -> String {
    std::env::var("KNFW_NFT_COMMAND")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_NFT_PATH.to_string())
}

fn elevated(method: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    // 1. Strict Test Mode Override (Highest Priority)
    // 2. Direct Root Execution
    if std::env::var("KNFW_TEST_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("KNFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" => {
                    if binary_exists(&method) {
                        Ok(elevated(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fall back to sudo
    for method in ["run0", "sudo"] {
        if binary_exists(method) {
            return Ok(elevated(method, program, args));
        }
    }

    Err(ElevationError::NoMethodAvailable)
}

/// Creates an elevated `nft` command with the specified arguments
///
/// Arguments are passed directly to `nft` without shell interpretation.
/// Callers must ensure arguments are properly validated before calling this function.
///
/// # Errors
///
/// `ElevationError` if no elevation method can be used.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(&nft_program(), args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("knfw_nonexistent_binary_xyz"));
    }

    #[tokio::test]
    async fn test_create_nft_command_test_mode() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("KNFW_TEST_NO_ELEVATION", "1");
        }

        let cmd = create_elevated_nft_command(&["-j", "list", "tables"]);

        unsafe {
            std::env::remove_var("KNFW_TEST_NO_ELEVATION");
        }

        assert!(cmd.is_ok());
    }

    #[test]
    fn test_nft_command_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("KNFW_NFT_COMMAND", "/opt/nft/bin/nft");
        }
        let program = nft_program();
        unsafe {
            std::env::remove_var("KNFW_NFT_COMMAND");
        }

        assert_eq!(program, "/opt/nft/bin/nft");
        assert_eq!(nft_program(), DEFAULT_NFT_PATH);
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        if nix::unistd::getuid().is_root() {
            // Root short-circuits elevation entirely
            return;
        }

        unsafe {
            std::env::remove_var("KNFW_TEST_NO_ELEVATION");
            std::env::set_var("KNFW_ELEVATION_METHOD", "pkexec");
        }

        let result = create_elevated_nft_command(&["list", "tables"]);

        unsafe {
            std::env::remove_var("KNFW_ELEVATION_METHOD");
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::remove_var("KNFW_TEST_NO_ELEVATION");
            std::env::set_var("KNFW_ELEVATION_METHOD", "SUDO");
        }

        let result = create_elevated_nft_command(&["list", "tables"]);

        unsafe {
            std::env::remove_var("KNFW_ELEVATION_METHOD");
        }

        // Succeeds (sudo exists, or root) or fails with MethodNotAvailable, never InvalidMethod
        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
