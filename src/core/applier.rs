//! Teardown and install of the allowlist chain for one address family
//!
//! Install is always remove-then-install: it runs [`teardown`] before
//! creating anything, so repeated runs never accumulate duplicate chains or
//! entry points and a half-finished earlier run is cleaned up first.
//!
//! # Install Order
//!
//! 1. Teardown (self-clean)
//! 2. Create the chain
//! 3. Append every rule, DROP last
//! 4. Verify the chain against the plan
//! 5. Insert the entry points
//!
//! The entry points come last so traffic is never dispatched into a chain
//! that is missing its terminal DROP.

use crate::core::error::{Error, Phase, Result};
use crate::core::filter::PacketFilter;
use crate::core::ruleset::{ChainSpec, FilterRule, PARENT_CHAIN, RuleAction};
use tracing::{debug, info, warn};

/// Upper bound on deletions of the same entry point during teardown.
///
/// Older tooling sometimes inserted the same jump more than once; teardown
/// deletes until iptables reports the rule as absent. Up to this many copies
/// are removed, one more is an error.
pub const MAX_STALE_BINDINGS: usize = 16;

/// What teardown found and removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// (port, number of bindings removed); zero means none were present
    pub bindings: Vec<(u16, usize)>,
    /// Parent-chain jumps into the chain that match no configured port,
    /// e.g. left over from an earlier port list
    pub stray_bindings: usize,
    pub chain_removed: bool,
}

impl TeardownReport {
    pub fn bindings_removed(&self) -> usize {
        self.bindings.iter().map(|(_, n)| n).sum::<usize>() + self.stray_bindings
    }

    /// True if there was nothing to remove
    pub fn was_clean(&self) -> bool {
        !self.chain_removed && self.bindings_removed() == 0
    }
}

/// What install did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub cleanup: TeardownReport,
    pub rules_installed: usize,
    pub ports_bound: Vec<u16>,
}

/// A rule of another chain that jumps into the allowlist chain
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    owner: String,
    args: Vec<String>,
}

impl Reference {
    fn line(&self) -> String {
        format!("-A {} {}", self.owner, self.args.join(" "))
    }
}

/// Finds every `-A OTHER ... -j CHAIN` (or `-g CHAIN`) line of an
/// `iptables -S` listing.
fn find_references(listing: &str, chain: &str) -> Vec<Reference> {
    listing
        .lines()
        .filter_map(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["-A", owner, args @ ..]
                    if *owner != chain
                        && args
                            .windows(2)
                            .any(|w| matches!(w[0], "-j" | "-g") && w[1] == chain) =>
                {
                    Some(Reference {
                        owner: (*owner).to_string(),
                        args: args.iter().map(|a| (*a).to_string()).collect(),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// Removes the chain's entry points, then flushes and deletes the chain.
///
/// Entry points for the configured ports go first. Any other parent-chain
/// rule still jumping into the chain is deleted next, so the chain is never
/// flushed while traffic can reach it. A reference from any other chain is
/// left alone and aborts teardown before the flush.
///
/// "Not found" at any step means that part is already gone and is not an
/// error. Any other failure aborts and is returned.
///
/// # Errors
///
/// Returns the first failure that is not a "not found" condition, or
/// [`Error::Referenced`] if a chain other than the parent jumps into it.
pub async fn teardown<F: PacketFilter>(filter: &F, spec: &ChainSpec) -> Result<TeardownReport> {
    let family = filter.family();
    let mut report = TeardownReport::default();

    for binding in spec.bindings() {
        let mut removed = 0;
        loop {
            match filter.delete_dispatch(&binding).await {
                Ok(()) => {
                    removed += 1;
                    if removed > MAX_STALE_BINDINGS {
                        return Err(Error::Internal(format!(
                            "{family}: still found entry points for port {} after {removed} deletions",
                            binding.port
                        )));
                    }
                }
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }
        if removed == 0 {
            debug!("{family}: no entry point for port {}", binding.port);
        } else {
            info!("{family}: removed {removed} entry point(s) for port {}", binding.port);
        }
        report.bindings.push((binding.port, removed));
    }

    let listing = filter.list_rules().await?;
    for reference in find_references(&listing, &spec.name) {
        if reference.owner != PARENT_CHAIN {
            return Err(Error::Referenced {
                chain: spec.name.clone(),
                rule: reference.line(),
            });
        }
        warn!("{family}: removing stray entry point `{}`", reference.line());
        match filter.delete_rule(&reference.owner, &reference.args).await {
            Ok(()) => report.stray_bindings += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    match filter.flush_chain(&spec.name).await {
        Ok(()) => match filter.delete_chain(&spec.name).await {
            Ok(()) => {
                info!("{family}: removed chain {}", spec.name);
                report.chain_removed = true;
            }
            Err(e) if e.is_not_found() => debug!("{family}: chain {} vanished", spec.name),
            Err(e) => return Err(e),
        },
        Err(e) if e.is_not_found() => debug!("{family}: chain {} not present", spec.name),
        Err(e) => return Err(e),
    }

    Ok(report)
}

/// Replaces the chain with `rules` and binds it to the protected ports.
///
/// # Errors
///
/// Returns [`Error::Phase`] naming the step that failed. A failure before the
/// bind step leaves at most an unbound chain behind, which the next run's
/// teardown removes.
pub async fn install<F: PacketFilter>(
    filter: &F,
    spec: &ChainSpec,
    rules: &[FilterRule],
) -> Result<InstallReport> {
    let family = filter.family();

    if rules.last().map(|r| r.action) != Some(RuleAction::Drop) {
        return Err(Error::Internal(format!(
            "refusing to install {} for {family}: rule list does not end in DROP",
            spec.name
        )));
    }

    let cleanup = teardown(filter, spec)
        .await
        .map_err(|e| e.in_phase(family, Phase::Teardown))?;

    filter
        .create_chain(&spec.name)
        .await
        .map_err(|e| e.in_phase(family, Phase::Create))?;

    for rule in rules {
        filter
            .append_rule(&spec.name, rule)
            .await
            .map_err(|e| e.in_phase(family, Phase::Populate))?;
    }
    info!("{family}: populated {} with {} rule(s)", spec.name, rules.len());

    crate::core::verify::verify_chain(filter, &spec.name, rules)
        .await
        .map_err(|e| e.in_phase(family, Phase::Verify))?;

    let mut ports_bound = Vec::with_capacity(spec.ports.len());
    for binding in spec.bindings() {
        filter
            .insert_dispatch(&binding)
            .await
            .map_err(|e| e.in_phase(family, Phase::Bind))?;
        ports_bound.push(binding.port);
    }
    info!("{family}: bound {} to {}", spec.name, spec.ports_display());

    Ok(InstallReport {
        cleanup,
        rules_installed: rules.len(),
        ports_bound,
    })
}
