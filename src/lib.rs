//! originwall - origin allowlist firewall
//!
//! Restricts inbound traffic on a web origin's public ports to the ranges of
//! the reverse proxy in front of it, while always admitting loopback and the
//! local cluster's pod and service networks.
//!
//! # Architecture
//!
//! - [`core`] - Rule set builder, iptables backend, install/teardown
//! - [`config`] - Allowlist configuration loading and validation
//! - [`validators`] - Input validation
//! - [`elevation`] - Privilege escalation for iptables
//! - [`utils`] - Config file locations
//!
//! # Safety Features
//!
//! - Every apply is remove-then-install, so re-running is always safe
//! - Entry points are inserted only after the chain is complete and verified
//! - Teardown tolerates "not found" and nothing else

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::ruleset::{AddressRange, Family, FilterRule};
