//! `nft` command-line backend
//!
//! Every call spawns the (possibly elevated) `nft` binary with the JSON
//! interface and pipes batches through stdin. `nft -f` commits a batch as a
//! single kernel transaction.

use crate::core::backend::{NftBackend, VerifyResult};
use crate::core::error::{Error, Result};
use crate::elevation::create_elevated_nft_command;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Backend driving the host's nftables through the `nft` binary
#[derive(Debug, Clone, Copy, Default)]
pub struct NftCli;

impl NftCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str], stdin: Option<&Value>) -> Result<std::process::Output> {
        let mut cmd = create_elevated_nft_command(args)?;
        // A caller that gives up on the future must not leave nft running
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn elevated nft: {e}");
            Error::Nftables {
                message: format!("Failed to spawn nft: {e}"),
                stderr: None,
                exit_code: None,
            }
        })?;

        if let Some(payload) = stdin {
            let json_string = serde_json::to_string(payload)?;
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(json_string.as_bytes()).await?;
                // Dropping the pipe closes stdin so nft starts parsing
            }
        }

        Ok(child.wait_with_output().await?)
    }

    fn failure(output: &std::process::Output) -> Error {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Error::Nftables {
            message: parse_nft_errors(&stderr)
                .into_iter()
                .next()
                .unwrap_or_else(|| "nft exited with an error".to_string()),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        }
    }
}

impl NftBackend for NftCli {
    async fn list_table(&self, table: &str) -> Result<Option<Value>> {
        let output = self.run(&["-j", "list", "table", "inet", table], None).await?;

        if output.status.success() {
            let value: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
                error!("Failed to parse nft list output: {e}");
                Error::Nftables {
                    message: format!("Unparsable nft output: {e}"),
                    stderr: None,
                    exit_code: output.status.code(),
                }
            })?;
            return Ok(Some(value));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") {
            debug!("Table inet {table} does not exist");
            return Ok(None);
        }
        Err(Self::failure(&output))
    }

    async fn check(&self, batch: &Value) -> Result<VerifyResult> {
        info!("Verifying ruleset via nft --json --check");
        let output = self.run(&["-j", "--check", "-f", "-"], Some(batch)).await?;

        if output.status.success() {
            info!("Ruleset verification passed");
            Ok(VerifyResult::success())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Ruleset verification failed: {}", stderr);
            Ok(VerifyResult::failure(parse_nft_errors(&stderr)))
        }
    }

    async fn write(&self, batch: &Value) -> Result<()> {
        let output = self.run(&["-j", "-f", "-"], Some(batch)).await?;

        if output.status.success() {
            info!("nft batch committed");
            Ok(())
        } else {
            let err = Self::failure(&output);
            error!("nft batch rejected: {err}");
            Err(err)
        }
    }

    async fn probe(&self) -> Result<()> {
        let output = self.run(&["-j", "list", "tables"], None).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::failure(&output))
        }
    }
}

/// Parses nft error output into user-friendly messages
///
/// Attempts to extract meaningful error information from nft's
/// stderr output, falling back to raw output if parsing fails.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    // Try to parse JSON error format first
    if let Ok(json_err) = serde_json::from_str::<Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    // Fall back to line-by-line parsing
    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        // Caret lines point into the batch and carry no message
        .filter(|line| !line.trim_start().starts_with('^'))
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}
