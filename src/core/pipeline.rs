//! Per-invocation orchestration across address families
//!
//! Each family is processed independently with the same logic. A failure in
//! one family is recorded and the next family still runs.

use crate::config::AllowlistConfig;
use crate::core::applier::{self, InstallReport, TeardownReport};
use crate::core::error::Error;
use crate::core::filter::PacketFilter;
use crate::core::ruleset::{Family, build};
use std::fmt;
use tracing::{error, info, warn};

/// What a single invocation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum Mode {
    #[strum(serialize = "apply")]
    Apply,
    #[default]
    #[strum(serialize = "dry-run")]
    DryRun,
    #[strum(serialize = "remove")]
    Remove,
}

/// Result of one family's processing
#[derive(Debug)]
pub enum Outcome {
    Applied(InstallReport),
    Removed(TeardownReport),
    /// Optional family whose packet filter is unavailable
    Skipped(Error),
    Failed(Error),
}

#[derive(Debug)]
pub struct FamilyOutcome {
    pub family: Family,
    pub outcome: Outcome,
}

/// Outcome of every family for one apply or remove run
#[derive(Debug)]
pub struct RunReport {
    pub mode: Mode,
    pub chain: String,
    pub ports: String,
    pub digest: Option<String>,
    pub outcomes: Vec<FamilyOutcome>,
}

impl RunReport {
    /// False if any family failed. Skipped optional families do not count,
    /// but an apply that installed nothing at all fails.
    pub fn succeeded(&self) -> bool {
        !self.nothing_applied()
            && !self
                .outcomes
                .iter()
                .any(|o| matches!(o.outcome, Outcome::Failed(_)))
    }

    /// True for an apply run in which no family was installed
    pub fn nothing_applied(&self) -> bool {
        self.mode == Mode::Apply
            && !self
                .outcomes
                .iter()
                .any(|o| matches!(o.outcome, Outcome::Applied(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (Family, &Error)> {
        self.outcomes.iter().filter_map(|o| match &o.outcome {
            Outcome::Failed(e) => Some((o.family, e)),
            _ => None,
        })
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: chain {}, ports {}", self.mode, self.chain, self.ports)?;
        if let Some(digest) = &self.digest {
            writeln!(f, "Plan digest: {digest}")?;
        }
        for o in &self.outcomes {
            write!(f, "  [{}] ", o.family)?;
            match &o.outcome {
                Outcome::Applied(r) => {
                    let ports: Vec<String> =
                        r.ports_bound.iter().map(u16::to_string).collect();
                    write!(
                        f,
                        "applied: {} rule(s), bound port(s) {}",
                        r.rules_installed,
                        ports.join(", ")
                    )?;
                    if !r.cleanup.was_clean() {
                        write!(
                            f,
                            " (replaced previous chain, {} old entry point(s))",
                            r.cleanup.bindings_removed()
                        )?;
                    }
                    writeln!(f)?;
                }
                Outcome::Removed(r) if r.was_clean() => {
                    writeln!(f, "removed: nothing was installed")?;
                }
                Outcome::Removed(r) => writeln!(
                    f,
                    "removed: {} entry point(s){}",
                    r.bindings_removed(),
                    if r.chain_removed { " and the chain" } else { "" }
                )?,
                Outcome::Skipped(e) => writeln!(f, "skipped: {e}")?,
                Outcome::Failed(e) => writeln!(f, "FAILED: {e}")?,
            }
        }
        if self.nothing_applied() {
            writeln!(f, "No address family was applied.")?;
        }
        write!(
            f,
            "{}",
            if self.succeeded() {
                "Done."
            } else {
                "Completed with errors."
            }
        )
    }
}

/// Classifies a family's error: unavailable optional families are skipped.
fn settle(family: Family, required: bool, err: Error) -> Outcome {
    if err.is_unavailable() && !required {
        warn!("{family}: packet filter unavailable, skipping: {err}");
        Outcome::Skipped(err)
    } else {
        error!("{family}: {err}");
        Outcome::Failed(err)
    }
}

fn new_report(mode: Mode, config: &AllowlistConfig, digest: Option<String>) -> RunReport {
    let spec = config.chain_spec();
    RunReport {
        mode,
        ports: spec.ports_display(),
        chain: spec.name,
        digest,
        outcomes: Vec::new(),
    }
}

/// Installs the allowlist chain on every filter's family.
pub async fn apply_all<F: PacketFilter>(
    config: &AllowlistConfig,
    filters: &[F],
    digest: Option<String>,
) -> RunReport {
    let spec = config.chain_spec();
    let mut report = new_report(Mode::Apply, config, digest);

    for filter in filters {
        let family = filter.family();
        let cfg = config.family(family);
        info!("{family}: applying {}", spec.name);

        let outcome = match build(family, &cfg.always_allow, &cfg.trusted) {
            Ok(rules) => match applier::install(filter, &spec, &rules).await {
                Ok(installed) => Outcome::Applied(installed),
                Err(e) => settle(family, config.is_required(family), e),
            },
            Err(e) => settle(family, config.is_required(family), e),
        };
        report.outcomes.push(FamilyOutcome { family, outcome });
    }

    report
}

/// Tears the allowlist chain down on every filter's family.
pub async fn remove_all<F: PacketFilter>(config: &AllowlistConfig, filters: &[F]) -> RunReport {
    let spec = config.chain_spec();
    let mut report = new_report(Mode::Remove, config, None);

    for filter in filters {
        let family = filter.family();
        info!("{family}: removing {}", spec.name);

        let outcome = match applier::teardown(filter, &spec).await {
            Ok(removed) => Outcome::Removed(removed),
            Err(e) => settle(
                family,
                config.is_required(family),
                e.in_phase(family, crate::core::error::Phase::Teardown),
            ),
        };
        report.outcomes.push(FamilyOutcome { family, outcome });
    }

    report
}
