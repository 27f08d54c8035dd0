//! knfw - Kubernetes node firewall
//!
//! Compiles a node network policy into nftables rules, applies them
//! atomically, verifies that the cluster still works and rolls back if not.
//!
//! # Usage
//!
//! ```bash
//! knfw compile policy.json --format nft      # Preview the generated rules
//! knfw apply policy.json                     # Apply, verify, roll back on failure
//! knfw apply policy.json --dry-run           # Same sequence against an in-memory copy
//! knfw apply policy.json --wait-ready 30     # Wait for nftables at boot
//! knfw diagnose policy.json                  # Why is a port blocked?
//! knfw rollback                              # Restore the newest snapshot
//! knfw snapshots show NAME --batch | nft -j -f -   # Offline recovery
//! knfw diff                                  # Newest snapshot vs live table
//! ```
//!
//! # Exit codes
//!
//! - `0`: success
//! - `1`: policy or configuration invalid
//! - `2`: verification failed (or interrupted) and the previous rules were restored
//! - `3`: apply failed and rollback failed; manual recovery required
//! - `4`: nftables unreachable, rejected the batch, or snapshot unusable

use clap::{Parser, Subcommand, ValueEnum};
use knfw::config::{EngineConfig, load_config};
use knfw::core::backend::{MemoryBackend, NftBackend};
use knfw::core::diagnostics::Diagnostics;
use knfw::core::enforce::{ApplyMode, ApplyOutcome, Applier, HostLock};
use knfw::core::error::{Error, NftablesErrorPattern, Result};
use knfw::core::nft::NftCli;
use knfw::core::policy::{LoadedPolicy, load_policy};
use knfw::core::snapshot::{Snapshot, SnapshotLog};
use knfw::utils::RetryPolicy;
use knfw::compile;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "knfw")]
#[command(about = "Kubernetes node firewall - compile, apply, verify and roll back nftables rules")]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Engine configuration file (default: <config_dir>/knfw/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Nft,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy and print the rule set
    Compile {
        policy: PathBuf,
        #[arg(short, long, value_enum, default_value = "nft")]
        format: Format,
        /// Treat policy lints as errors
        #[arg(long)]
        strict: bool,
    },
    /// Apply a policy, verify it and roll back on failure
    Apply {
        policy: PathBuf,
        #[arg(long)]
        strict: bool,
        /// First install: skip capturing the live table
        #[arg(long)]
        bootstrap: bool,
        /// Run the full sequence against an in-memory copy of the live table
        #[arg(long)]
        dry_run: bool,
        /// Wait up to SECS for nftables to answer before applying
        #[arg(long, value_name = "SECS")]
        wait_ready: Option<u64>,
    },
    /// Explain why required endpoints are blocked (read-only)
    Diagnose {
        policy: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Restore the newest snapshot, or the named one
    Rollback { snapshot: Option<String> },
    /// Inspect the snapshot log
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Unified diff of a snapshot (default: newest) against the live table
    Diff { snapshot: Option<String> },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots, newest first
    List,
    /// Print a snapshot
    Show {
        name: String,
        /// Print the nft batch that recreates it (`| nft -j -f -`)
        #[arg(long)]
        batch: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::from(4);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn report_error(error: &Error) {
    eprintln!("✗ {error}");

    match error {
        Error::VerificationFailed { failures, .. } => {
            for failure in failures {
                eprintln!("  {failure}");
            }
            eprintln!("Previous rules were restored.");
        }
        Error::Restore { failures, .. } if !failures.is_empty() => {
            eprintln!("  Restore was attempted after these checks failed:");
            for failure in failures {
                eprintln!("  {failure}");
            }
        }
        Error::Nftables { message, .. } | Error::Capture(message) => {
            let translation = NftablesErrorPattern::match_error(message);
            eprintln!("  {}", translation.user_message);
            for suggestion in translation.suggestions {
                eprintln!("  • {suggestion}");
            }
        }
        _ => {}
    }

    if let Some(instructions) = error.recovery_instructions() {
        eprintln!();
        eprintln!("{instructions}");
    }
}

async fn load(path: &Path, strict: bool) -> Result<LoadedPolicy> {
    let loaded = load_policy(path, strict).await?;
    for warning in &loaded.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(loaded)
}

fn applier<B: NftBackend>(backend: B, config: &EngineConfig, state_dir: &Path) -> Result<Applier<B>> {
    Ok(Applier::new(backend, state_dir)
        .with_table(config.table.clone())
        .with_verifier(config.verifier()?)
        .with_retention(config.snapshot_retention))
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref()).await?;
    let state_dir = config.state_dir();

    match cli.command {
        Commands::Compile {
            policy,
            format,
            strict,
        } => {
            let loaded = load(&policy, strict || config.strict).await?;
            let ruleset = compile(&loaded.policy, &config.table);
            match format {
                Format::Nft => print!("{}", ruleset.to_nft_text()),
                Format::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&ruleset.to_nftables_json())?
                ),
            }
        }
        Commands::Apply {
            policy,
            strict,
            bootstrap,
            dry_run,
            wait_ready,
        } => {
            let loaded = load(&policy, strict || config.strict).await?;
            let ruleset = compile(&loaded.policy, &config.table);
            let mode = if bootstrap {
                ApplyMode::Bootstrap
            } else {
                ApplyMode::Normal
            };

            let host = applier(NftCli::new(), &config, &state_dir)?
                .with_lock_path(config.lock_path())
                .with_mode(mode);

            if let Some(secs) = wait_ready {
                host.wait_ready(RetryPolicy::within(Duration::from_secs(secs)))
                    .await?;
            }

            if dry_run {
                let live = host.capture().await?;
                let simulated = MemoryBackend::new();
                simulated.write(&live.restore_batch()?).await?;

                let scratch = tempfile::tempdir()?;
                let sim = applier(simulated, &config, scratch.path())?.with_mode(mode);
                sim.log().write_generation(host.log().read_generation()?)?;

                println!("Dry run against an in-memory copy of table inet {}", config.table);
                let outcome = sim.apply(&loaded.policy, ruleset).await?;
                print_outcome(&outcome);
                println!("✓ Dry run passed; live rules were not changed.");
            } else {
                if !nix::unistd::getuid().is_root() {
                    println!("Note: Not running as root. Will use sudo/run0 for nft.");
                }
                let outcome = host.apply(&loaded.policy, ruleset).await?;
                print_outcome(&outcome);
            }
        }
        Commands::Diagnose { policy, json } => {
            let loaded = load(&policy, false).await?;
            let backend = NftCli::new();
            let host = config.host();
            let report = Diagnostics::new(&backend, &host, config.table.clone())
                .with_verifier(config.verifier()?)
                .with_lock(HostLock::new(config.lock_path()))
                .diagnose(&loaded.policy)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        Commands::Rollback { snapshot } => {
            let host = applier(NftCli::new(), &config, &state_dir)?.with_lock_path(config.lock_path());
            let record = host.rollback(snapshot.as_deref()).await?;
            println!(
                "✓ Restored {} (generation {})",
                record.name,
                record
                    .snapshot
                    .generation
                    .map_or_else(|| "none".to_string(), |g| g.to_string())
            );
        }
        Commands::Snapshots { command } => {
            let log = SnapshotLog::new(&state_dir);
            match command {
                SnapshotCommands::List => {
                    let entries = log.list()?;
                    if entries.is_empty() {
                        println!("No snapshots in {}", log.dir().display());
                    }
                    for entry in entries {
                        match log.load(&entry.name) {
                            Ok(record) => println!(
                                "{}  generation={}  {}",
                                entry.name,
                                record
                                    .snapshot
                                    .generation
                                    .map_or_else(|| "-".to_string(), |g| g.to_string()),
                                if record.snapshot.is_absent() {
                                    "(table absent)"
                                } else {
                                    ""
                                }
                            ),
                            Err(e) => println!("{}  UNUSABLE: {e}", entry.name),
                        }
                    }
                }
                SnapshotCommands::Show { name, batch } => {
                    let record = log.load(&name)?;
                    let value = if batch {
                        record.snapshot.restore_batch()?
                    } else {
                        serde_json::to_value(&record.snapshot)?
                    };
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
            }
        }
        Commands::Diff { snapshot } => {
            let host = applier(NftCli::new(), &config, &state_dir)?.with_lock_path(config.lock_path());
            let record = match snapshot {
                Some(name) => host.log().load(&name)?,
                None => host.log().latest()?.ok_or_else(|| {
                    Error::Snapshot(knfw::core::error::SnapshotError::NotFound(
                        "no snapshots recorded".to_string(),
                    ))
                })?,
            };
            let live = host.capture().await?;

            let old = render(&record.snapshot)?;
            let new = render(&live)?;
            if old == new {
                println!("No differences between {} and the live table.", record.name);
            } else {
                let diff = similar::TextDiff::from_lines(&old, &new);
                print!(
                    "{}",
                    diff.unified_diff()
                        .context_radius(3)
                        .header(&record.name, "live")
                );
            }
        }
    }
    Ok(())
}

/// nft text of a snapshot; empty for an absent table
fn render(snapshot: &Snapshot) -> Result<String> {
    Ok(snapshot
        .rule_set()?
        .map(|ruleset| ruleset.to_nft_text())
        .unwrap_or_default())
}

fn print_outcome(outcome: &ApplyOutcome) {
    for check in &outcome.checks {
        println!("  {check}");
    }
    if outcome.unchanged {
        println!(
            "✓ Rules unchanged (generation {}, fingerprint {})",
            outcome.generation,
            &outcome.fingerprint[..12.min(outcome.fingerprint.len())]
        );
    } else {
        println!(
            "✓ Applied generation {} (fingerprint {})",
            outcome.generation,
            &outcome.fingerprint[..12.min(outcome.fingerprint.len())]
        );
    }
    println!("  Pre-apply snapshot: {}", outcome.snapshot.name);
}
