//! knfw - Kubernetes node firewall
//!
//! Compiles a declarative node network policy into an nftables rule set,
//! atomically replaces the live table, verifies it, and reverts to the last
//! known-good state on failure.
//!
//! # Architecture
//!
//! - [`core`] - Policy model, compiler, applier, verifier and diagnostics
//! - [`audit`] - Audit trail for all privileged operations
//! - [`config`] - Engine configuration
//! - [`elevation`] - Privilege elevation for `nft`
//! - [`validators`] - Input validation and sanitization
//! - [`utils`] - XDG directories, bounded retry, interface matching
//!
//! # Safety Features
//!
//! - Pre-apply snapshot written to disk before any mutation
//! - Pre-apply verification with `nft --check`
//! - Single atomic nft transaction per apply
//! - Post-apply reachability verification with automatic rollback
//! - SHA-256 snapshot checksums
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::compiler::compile;
pub use core::error::{Error, Result};
pub use core::policy::Policy;
pub use core::ruleset::RuleSet;
