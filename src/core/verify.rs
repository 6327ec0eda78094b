//! Verification of a populated chain before it is bound
//!
//! This module lists the chain back from the packet filter and compares it
//! with the planned rules, so a chain that iptables silently altered is never
//! put in front of live traffic.

use crate::core::error::{Error, Result};
use crate::core::filter::PacketFilter;
use crate::core::ruleset::FilterRule;
use tracing::{info, warn};

/// Result of a chain verification
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Creates a successful verification result
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    /// Creates a failed verification result with errors
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

/// Lists `chain` and checks it holds exactly `expected`, in order.
///
/// # Errors
///
/// Returns `Err` if the listing fails, or [`Error::Verification`] with every
/// difference found.
pub async fn verify_chain<F: PacketFilter>(
    filter: &F,
    chain: &str,
    expected: &[FilterRule],
) -> Result<()> {
    let listing = filter.list_chain(chain).await?;
    let result = compare_listing(&listing, chain, expected);

    if result.success {
        info!("{}: chain {chain} verified ({} rules)", filter.family(), expected.len());
        Ok(())
    } else {
        warn!("{}: chain {chain} verification failed: {:?}", filter.family(), result.errors);
        Err(Error::Verification(result.errors))
    }
}

/// Extracts the `-A CHAIN ...` lines of an `iptables -S` listing, with
/// whitespace normalized.
fn parse_chain_listing(listing: &str, chain: &str) -> Vec<String> {
    let prefix = format!("-A {chain} ");
    listing
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| line.starts_with(&prefix))
        .collect()
}

/// Compares a listing against the planned rules
fn compare_listing(listing: &str, chain: &str, expected: &[FilterRule]) -> VerifyResult {
    let actual = parse_chain_listing(listing, chain);
    let expected: Vec<String> = expected.iter().map(|r| r.spec_line(chain)).collect();

    let mut errors = Vec::new();

    if actual.len() != expected.len() {
        errors.push(format!(
            "expected {} rules, found {}",
            expected.len(),
            actual.len()
        ));
    }

    for (i, (want, got)) in expected.iter().zip(&actual).enumerate() {
        if want != got {
            errors.push(format!("rule {}: expected `{want}`, found `{got}`", i + 1));
        }
    }

    for missing in expected.iter().skip(actual.len()) {
        errors.push(format!("missing `{missing}`"));
    }
    for extra in actual.iter().skip(expected.len()) {
        errors.push(format!("unexpected `{extra}`"));
    }

    if errors.is_empty() {
        VerifyResult::success()
    } else {
        VerifyResult::failure(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ruleset::{AddressRange, Family, RuleOrigin, build};

    fn planned() -> Vec<FilterRule> {
        let always: Vec<AddressRange> = vec!["127.0.0.0/8".parse().unwrap()];
        let trusted: Vec<AddressRange> = vec!["173.245.48.0/20".parse().unwrap()];
        build(Family::Ipv4, &always, &trusted).unwrap()
    }

    #[test]
    fn test_parse_listing_skips_chain_header() {
        let listing = "-N X\n-A X -s 127.0.0.0/8 -j ACCEPT\n-A  X   -j DROP\n";
        let lines = parse_chain_listing(listing, "X");
        assert_eq!(lines, vec!["-A X -s 127.0.0.0/8 -j ACCEPT", "-A X -j DROP"]);
    }

    #[test]
    fn test_parse_listing_ignores_other_chains() {
        let listing = "-N XY\n-A XY -j DROP\n";
        assert!(parse_chain_listing(listing, "X").is_empty());
    }

    #[test]
    fn test_compare_exact_match() {
        let listing = "-N X\n-A X -s 127.0.0.0/8 -j ACCEPT\n-A X -s 173.245.48.0/20 -j ACCEPT\n-A X -j DROP\n";
        let result = compare_listing(listing, "X", &planned());
        assert!(result.success, "{:?}", result.errors);
    }

    #[test]
    fn test_compare_missing_drop() {
        let listing = "-N X\n-A X -s 127.0.0.0/8 -j ACCEPT\n-A X -s 173.245.48.0/20 -j ACCEPT\n";
        let result = compare_listing(listing, "X", &planned());
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("missing `-A X -j DROP`")));
    }

    #[test]
    fn test_compare_wrong_order() {
        let listing = "-N X\n-A X -s 127.0.0.0/8 -j ACCEPT\n-A X -j DROP\n-A X -s 173.245.48.0/20 -j ACCEPT\n";
        let result = compare_listing(listing, "X", &planned());
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.starts_with("rule 2:")));
    }

    #[test]
    fn test_compare_extra_rule() {
        let mut rules = planned();
        rules.remove(1);
        let listing = "-N X\n-A X -s 127.0.0.0/8 -j ACCEPT\n-A X -j DROP\n-A X -j DROP\n";
        let result = compare_listing(listing, "X", &rules);
        assert!(result.errors.iter().any(|e| e.contains("unexpected")));
        assert_eq!(rules[0].origin, RuleOrigin::AlwaysAllow);
    }

    #[test]
    fn test_verify_result_failure() {
        let errors = vec!["error 1".to_string(), "error 2".to_string()];
        let result = VerifyResult::failure(errors.clone());

        assert!(!result.success);
        assert_eq!(result.errors, errors);
    }
}
