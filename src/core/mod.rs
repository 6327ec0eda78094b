//! Core allowlist chain management
//!
//! This module contains the types and logic for building the allowlist chain
//! and moving the live packet filter to it. It provides:
//!
//! - [`ruleset`]: Data structures and the rule set builder
//! - [`filter`]: The packet-filter abstraction and iptables backend
//! - [`applier`]: Teardown and install of the chain for one family
//! - [`verify`]: Post-population chain verification
//! - [`plan`]: Dry-run rendering and plan digests
//! - [`pipeline`]: Mode orchestration across address families
//! - [`error`]: Error types and failure classification

pub mod applier;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod plan;
pub mod ruleset;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
