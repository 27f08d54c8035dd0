//! Core firewall compiler and enforcement engine
//!
//! - [`policy`]: declarative desired state and its validation
//! - [`compiler`] and [`ruleset`]: policy → ordered nftables rule set
//! - [`eval`]: first-match-wins evaluation of synthetic packets
//! - [`backend`] and [`nft`]: read/check/write seam to nftables
//! - [`snapshot`]: capture, restore and the on-disk snapshot log
//! - [`enforce`]: the Applier, the only writer of live state
//! - [`verify`]: post-apply checks
//! - [`diagnostics`]: ranked triage reports
//! - [`error`]: error taxonomy and exit codes

pub mod backend;
pub mod compiler;
pub mod diagnostics;
pub mod enforce;
pub mod error;
pub mod eval;
pub mod nft;
pub mod policy;
pub mod ruleset;
pub mod snapshot;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
