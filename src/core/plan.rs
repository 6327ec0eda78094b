//! Dry-run rendering of the planned chains
//!
//! [`Plan`] holds the built rule list of every family. Rendering it issues no
//! packet-filter calls at all. [`Plan::digest`] lets an operator match an
//! apply report against an earlier dry-run.

use crate::config::AllowlistConfig;
use crate::core::error::Result;
use crate::core::ruleset::{ChainSpec, Family, FilterRule, build};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Planned rules for one family
#[derive(Debug, Clone)]
pub struct FamilyPlan {
    pub family: Family,
    pub rules: Vec<FilterRule>,
}

/// Planned rules for all families plus the chain they go into
#[derive(Debug, Clone)]
pub struct Plan {
    pub spec: ChainSpec,
    pub provider: String,
    pub version: u32,
    pub families: Vec<FamilyPlan>,
}

impl Plan {
    /// Builds the rule list of every family in `families`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any family's ranges fail [`build`].
    pub fn from_config(config: &AllowlistConfig, families: &[Family]) -> Result<Self> {
        let families = families
            .iter()
            .map(|&family| {
                let cfg = config.family(family);
                build(family, &cfg.always_allow, &cfg.trusted)
                    .map(|rules| FamilyPlan { family, rules })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            spec: config.chain_spec(),
            provider: config.provider.clone(),
            version: config.version,
            families,
        })
    }

    /// SHA-256 over the rendered rule and binding lines of every family.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for plan in &self.families {
            hasher.update(plan.family.as_ref().as_bytes());
            hasher.update(b"\n");
            for rule in &plan.rules {
                hasher.update(rule.spec_line(&self.spec.name).as_bytes());
                hasher.update(b"\n");
            }
            for binding in self.spec.bindings() {
                hasher.update(binding.spec_line().as_bytes());
                hasher.update(b"\n");
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Short form of [`Plan::digest`] for reports
    pub fn short_digest(&self) -> String {
        self.digest()[..12].to_string()
    }

    /// Warning printed with every dry-run
    pub fn advisory(&self) -> String {
        format!(
            "WARNING: once applied, ports {} only accept connections from {} and the \
             always-allowed ranges.\n\
             Direct-to-origin traffic is dropped: DNS records that are not proxied through \
             {}, health checks,\nmonitoring and clients connecting to this host's address \
             directly will stop working.",
            self.spec.ports_display(),
            self.provider,
            self.provider,
        )
    }

    /// Human-readable plan, as printed by `--dry-run`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let chain = &self.spec.name;

        let _ = writeln!(out, "Dry run: no changes will be made.");
        let _ = writeln!(
            out,
            "Chain {chain}, protected ports {}, allowlist v{} ({})",
            self.spec.ports_display(),
            self.version,
            self.provider
        );
        let _ = writeln!(out, "Plan digest: {}", self.short_digest());

        for plan in &self.families {
            let _ = writeln!(out);
            let _ = writeln!(out, "[{}] {}", plan.family, plan.family.program());
            let _ = writeln!(out, "  -N {chain}");
            for rule in &plan.rules {
                let _ = writeln!(
                    out,
                    "  {:<56} # {}",
                    rule.spec_line(chain),
                    rule.origin
                );
            }
            for binding in self.spec.bindings() {
                let _ = writeln!(out, "  {:<56} # port {}", binding.spec_line(), binding.port);
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{}", self.advisory());

        out
    }
}
