//! Shared test utilities for core module tests
//!
//! Provides an in-memory packet filter that behaves like iptables for the
//! operations the applier uses. This module is only compiled in test mode.

use crate::core::error::{Error, FailureKind, Result};
use crate::core::filter::PacketFilter;
use crate::core::ruleset::{AddressRange, DispatchBinding, Family, FilterRule, PARENT_CHAIN};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("ORIGINWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("ORIGINWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Live state of one family's filter table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    /// Custom chains and their rules as `-A CHAIN ...` lines
    pub chains: BTreeMap<String, Vec<String>>,
    /// Parent chain rules as `-I INPUT ...` lines, top first
    pub input: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: FilterState,
    calls: Vec<String>,
    unavailable: bool,
    deny: bool,
    fail_append_at: Option<usize>,
    appended: usize,
    listing_override: Option<String>,
}

/// Stateful in-memory [`PacketFilter`].
///
/// Mirrors iptables behavior: missing chains and rules report
/// [`FailureKind::NotFound`], a chain cannot be deleted while referenced or
/// non-empty, and creating an existing chain is a conflict.
#[derive(Debug)]
pub struct MockFilter {
    family: Family,
    inner: Mutex<Inner>,
}

fn failure(kind: FailureKind, message: &str) -> Error {
    Error::Filter {
        command: "mock".to_string(),
        kind,
        message: message.to_string(),
        exit_code: Some(1),
    }
}

fn not_found() -> Error {
    failure(
        FailureKind::NotFound,
        "iptables: No chain/target/match by that name.",
    )
}

impl MockFilter {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Every call fails as if the kernel table were missing
    pub fn unavailable(family: Family) -> Self {
        let filter = Self::new(family);
        filter.inner.lock().unwrap().unavailable = true;
        filter
    }

    /// Every call fails with "permission denied"
    pub fn denied(family: Family) -> Self {
        let filter = Self::new(family);
        filter.inner.lock().unwrap().deny = true;
        filter
    }

    /// The `n`th append (zero-based, counted across the filter's lifetime) fails
    pub fn fail_append_at(&self, n: usize) {
        self.inner.lock().unwrap().fail_append_at = Some(n);
    }

    /// `list_chain` returns `listing` instead of the real state
    pub fn override_listing(&self, listing: &str) {
        self.inner.lock().unwrap().listing_override = Some(listing.to_string());
    }

    /// Seeds pre-existing state, e.g. residue from an earlier run
    pub fn seed(&self, state: FilterState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn state(&self) -> FilterState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Operations issued so far, e.g. `"-N X"`, `"-I INPUT -p tcp ..."`
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn begin(&self, call: String) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        if inner.deny {
            return Err(failure(
                FailureKind::PermissionDenied,
                "Permission denied (you must be root)",
            ));
        }
        if inner.unavailable {
            return Err(failure(
                FailureKind::Unavailable,
                "can't initialize iptables table `filter': Table does not exist (do you need to insmod?)",
            ));
        }
        Ok(inner)
    }
}

impl PacketFilter for MockFilter {
    fn family(&self) -> Family {
        self.family
    }

    async fn create_chain(&self, chain: &str) -> Result<()> {
        let mut inner = self.begin(format!("-N {chain}"))?;
        if inner.state.chains.contains_key(chain) {
            return Err(failure(FailureKind::Conflict, "iptables: Chain already exists."));
        }
        inner.state.chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        let mut inner = self.begin(format!("-F {chain}"))?;
        inner.state.chains.get_mut(chain).ok_or_else(not_found)?.clear();
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        let mut inner = self.begin(format!("-X {chain}"))?;
        let suffix = format!("-j {chain}");
        if inner.state.input.iter().any(|line| line.ends_with(&suffix)) {
            return Err(failure(FailureKind::Conflict, "iptables: Too many links."));
        }
        let empty = inner
            .state
            .chains
            .get(chain)
            .map(Vec::is_empty)
            .ok_or_else(not_found)?;
        if !empty {
            return Err(failure(
                FailureKind::Conflict,
                "iptables: Directory not empty.",
            ));
        }
        inner.state.chains.remove(chain);
        Ok(())
    }

    async fn append_rule(&self, chain: &str, rule: &FilterRule) -> Result<()> {
        let line = rule.spec_line(chain);
        let mut inner = self.begin(line.clone())?;
        let n = inner.appended;
        inner.appended += 1;
        if inner.fail_append_at == Some(n) {
            return Err(failure(
                FailureKind::Other,
                "iptables v1.8.9 (nf_tables): RULE_APPEND failed (Invalid argument)",
            ));
        }
        inner.state.chains.get_mut(chain).ok_or_else(not_found)?.push(line);
        Ok(())
    }

    async fn insert_dispatch(&self, binding: &DispatchBinding) -> Result<()> {
        let line = binding.spec_line();
        let mut inner = self.begin(line.clone())?;
        if !inner.state.chains.contains_key(&binding.target) {
            return Err(failure(
                FailureKind::NotFound,
                "iptables: Couldn't load target `ORIGIN_ALLOWLIST':No such file or directory",
            ));
        }
        inner.state.input.insert(0, line);
        Ok(())
    }

    async fn delete_dispatch(&self, binding: &DispatchBinding) -> Result<()> {
        let line = binding.spec_line();
        let mut inner = self.begin(format!("-D{}", &line[2..]))?;
        let pos = inner.state.input.iter().position(|l| *l == line).ok_or_else(|| {
            failure(
                FailureKind::NotFound,
                "iptables: Bad rule (does a matching rule exist in that chain?).",
            )
        })?;
        inner.state.input.remove(pos);
        Ok(())
    }

    async fn delete_rule(&self, chain: &str, args: &[String]) -> Result<()> {
        let mut inner = self.begin(format!("-D {chain} {}", args.join(" ")))?;
        let bad_rule = || {
            failure(
                FailureKind::NotFound,
                "iptables: Bad rule (does a matching rule exist in that chain?).",
            )
        };
        if chain == PARENT_CHAIN {
            let line = format!("-I {chain} {}", args.join(" "));
            let pos = inner.state.input.iter().position(|l| *l == line).ok_or_else(bad_rule)?;
            inner.state.input.remove(pos);
        } else {
            let line = format!("-A {chain} {}", args.join(" "));
            let rules = inner.state.chains.get_mut(chain).ok_or_else(not_found)?;
            let pos = rules.iter().position(|l| *l == line).ok_or_else(bad_rule)?;
            rules.remove(pos);
        }
        Ok(())
    }

    async fn list_rules(&self) -> Result<String> {
        let inner = self.begin("-S".to_string())?;
        let mut out = format!("-P {PARENT_CHAIN} ACCEPT\n");
        for chain in inner.state.chains.keys() {
            out.push_str(&format!("-N {chain}\n"));
        }
        for line in &inner.state.input {
            out.push_str(&format!("-A{}\n", &line[2..]));
        }
        for line in inner.state.chains.values().flatten() {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    async fn list_chain(&self, chain: &str) -> Result<String> {
        let inner = self.begin(format!("-S {chain}"))?;
        if let Some(listing) = &inner.listing_override {
            return Ok(listing.clone());
        }
        let rules = inner.state.chains.get(chain).ok_or_else(not_found)?;
        let mut out = format!("-N {chain}\n");
        for line in rules {
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Parses a list of CIDR strings
pub fn ranges(list: &[&str]) -> Vec<AddressRange> {
    list.iter().map(|s| s.parse().unwrap()).collect()
}

/// Always-allow ranges used throughout the tests
pub fn always_allow_v4() -> Vec<AddressRange> {
    ranges(&["10.42.0.0/16", "10.43.0.0/16", "127.0.0.0/8"])
}

/// Trusted ranges used throughout the tests
pub fn trusted_v4() -> Vec<AddressRange> {
    ranges(&["173.245.48.0/20", "103.21.244.0/22"])
}
