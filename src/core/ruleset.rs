//! Rule set data structures and the rule set builder
//!
//! This module defines the types that describe an allowlist chain and
//! provides [`build`], which turns a family's always-allow and trusted ranges
//! into the ordered rule list installed into the chain.
//!
//! # Chain Layout
//!
//! ```text
//! -A ORIGIN_ALLOWLIST -s 10.42.0.0/16 -j ACCEPT      (always allow)
//! -A ORIGIN_ALLOWLIST -s 173.245.48.0/20 -j ACCEPT   (trusted)
//! -A ORIGIN_ALLOWLIST -j DROP                        (default deny)
//! ```
//!
//! Accept rules are interchangeable among themselves. The DROP is always last.
//!
//! # Example
//!
//! ```
//! use originwall::core::ruleset::{build, AddressRange, Family, RuleAction};
//!
//! let always: Vec<AddressRange> = vec!["127.0.0.0/8".parse().unwrap()];
//! let trusted: Vec<AddressRange> = vec!["173.245.48.0/20".parse().unwrap()];
//!
//! let rules = build(Family::Ipv4, &always, &trusted).unwrap();
//! assert_eq!(rules.len(), 3);
//! assert_eq!(rules[2].action, RuleAction::Drop);
//! ```

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chain the dispatch bindings are inserted into.
pub const PARENT_CHAIN: &str = "INPUT";

/// Address family of a range, chain, or backend.
///
/// `Copy` trait allows efficient passing by value for this small enum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Family {
    #[strum(serialize = "IPv4")]
    Ipv4,
    #[strum(serialize = "IPv6")]
    Ipv6,
}

impl Family {
    /// Name of the userspace tool managing this family's filter table
    pub const fn program(self) -> &'static str {
        match self {
            Family::Ipv4 => "iptables",
            Family::Ipv6 => "ip6tables",
        }
    }

    /// Environment variable that overrides [`Family::program`]
    pub const fn command_env(self) -> &'static str {
        match self {
            Family::Ipv4 => "ORIGINWALL_IPTABLES_COMMAND",
            Family::Ipv6 => "ORIGINWALL_IP6TABLES_COMMAND",
        }
    }

    pub const fn of(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => Family::Ipv4,
            IpNetwork::V6(_) => Family::Ipv6,
        }
    }
}

/// A CIDR network prefix. The family is carried by the prefix itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressRange(IpNetwork);

impl AddressRange {
    pub const fn new(network: IpNetwork) -> Self {
        Self(network)
    }

    pub const fn family(&self) -> Family {
        Family::of(&self.0)
    }

    pub const fn network(&self) -> IpNetwork {
        self.0
    }
}

impl From<IpNetwork> for AddressRange {
    fn from(network: IpNetwork) -> Self {
        Self(network)
    }
}

impl FromStr for AddressRange {
    type Err = ipnetwork::IpNetworkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens to a packet matching a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum RuleAction {
    /// Accept and stop evaluating the chain
    #[strum(serialize = "ACCEPT")]
    AcceptAndReturn,
    #[strum(serialize = "DROP")]
    Drop,
}

/// Where a rule came from, for reports only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RuleOrigin {
    #[strum(serialize = "always allow")]
    AlwaysAllow,
    #[strum(serialize = "trusted")]
    Trusted,
    #[strum(serialize = "default deny")]
    DefaultDeny,
}

/// Source match of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Range(AddressRange),
}

/// A single entry of the allowlist chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRule {
    pub source: Source,
    pub action: RuleAction,
    pub origin: RuleOrigin,
}

impl FilterRule {
    pub fn accept(range: AddressRange, origin: RuleOrigin) -> Self {
        Self {
            source: Source::Range(range),
            action: RuleAction::AcceptAndReturn,
            origin,
        }
    }

    pub fn drop_all() -> Self {
        Self {
            source: Source::Any,
            action: RuleAction::Drop,
            origin: RuleOrigin::DefaultDeny,
        }
    }

    /// iptables match and target arguments, without the chain operation
    pub fn match_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Source::Range(range) = self.source {
            args.push("-s".to_string());
            args.push(range.to_string());
        }
        args.push("-j".to_string());
        args.push(self.action.as_ref().to_string());
        args
    }

    /// The rule as `iptables -S` prints it
    pub fn spec_line(&self, chain: &str) -> String {
        format!("-A {chain} {}", self.match_args().join(" "))
    }
}

/// Transport protocol of the protected ports
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// Entry point jumping from the parent chain into the allowlist chain for
/// one protected port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchBinding {
    pub port: u16,
    pub protocol: Protocol,
    pub target: String,
}

impl DispatchBinding {
    /// Match and target arguments shared by insert (`-I`) and delete (`-D`)
    pub fn match_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.protocol.as_ref().to_string(),
            "--dport".to_string(),
            self.port.to_string(),
            "-j".to_string(),
            self.target.clone(),
        ]
    }

    pub fn spec_line(&self) -> String {
        format!("-I {PARENT_CHAIN} {}", self.match_args().join(" "))
    }
}

/// The named chain and the ports dispatched into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub name: String,
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

impl ChainSpec {
    pub fn bindings(&self) -> impl Iterator<Item = DispatchBinding> + '_ {
        self.ports.iter().map(|&port| DispatchBinding {
            port,
            protocol: self.protocol,
            target: self.name.clone(),
        })
    }

    /// "80, 443/tcp"
    pub fn ports_display(&self) -> String {
        let ports: Vec<String> = self.ports.iter().map(u16::to_string).collect();
        format!("{}/{}", ports.join(", "), self.protocol)
    }
}

/// Builds the ordered rule list for one family.
///
/// Every `always_allow` range, then every `trusted` range, each as an accept
/// rule in the given order, followed by a single DROP. An empty `trusted`
/// list is valid and locks the ports down to `always_allow` sources.
///
/// # Errors
///
/// Returns [`Error::FamilyMismatch`] if any range belongs to the other family.
pub fn build(
    family: Family,
    always_allow: &[AddressRange],
    trusted: &[AddressRange],
) -> Result<Vec<FilterRule>> {
    if let Some(stray) = always_allow
        .iter()
        .chain(trusted)
        .find(|range| range.family() != family)
    {
        return Err(Error::FamilyMismatch {
            range: stray.network(),
            expected: family,
        });
    }

    let mut rules = Vec::with_capacity(always_allow.len() + trusted.len() + 1);
    rules.extend(
        always_allow
            .iter()
            .map(|&range| FilterRule::accept(range, RuleOrigin::AlwaysAllow)),
    );
    rules.extend(
        trusted
            .iter()
            .map(|&range| FilterRule::accept(range, RuleOrigin::Trusted)),
    );
    rules.push(FilterRule::drop_all());

    Ok(rules)
}
