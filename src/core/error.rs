use crate::core::ruleset::Family;
use ipnetwork::IpNetwork;
use thiserror::Error;

/// Core error types for originwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables/ip6tables exited unsuccessfully or could not be started
    #[error("`{command}` failed ({kind}): {message}")]
    Filter {
        command: String,
        kind: FailureKind,
        message: String,
        exit_code: Option<i32>,
    },

    /// A range was handed to the builder for the wrong address family
    #[error("{range} is not an {expected} range")]
    FamilyMismatch { range: IpNetwork, expected: Family },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Allowlist configuration could not be located or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// A rule outside the parent chain still jumps into the chain
    #[error("Chain {chain} is still referenced by `{rule}`")]
    Referenced { chain: String, rule: String },

    /// Live chain contents differ from the planned rules
    #[error("Chain verification failed: {}", .0.join("; "))]
    Verification(Vec<String>),

    /// A step of the install/teardown sequence failed for one family
    #[error("{phase} failed for {family}: {source}")]
    Phase {
        family: Family,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a packet-filter call failed, as far as the caller cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FailureKind {
    /// Chain or rule absent. The only failure teardown tolerates.
    #[strum(serialize = "not found")]
    NotFound,
    #[strum(serialize = "permission denied")]
    PermissionDenied,
    /// The tool or the kernel table for this family is missing.
    #[strum(serialize = "subsystem unavailable")]
    Unavailable,
    /// Chain already exists, is still referenced, or is not empty.
    #[strum(serialize = "conflict")]
    Conflict,
    #[strum(serialize = "error")]
    Other,
}

/// Step of the per-family transition, used to give failures context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    #[strum(serialize = "Teardown")]
    Teardown,
    #[strum(serialize = "Chain creation")]
    Create,
    #[strum(serialize = "Chain population")]
    Populate,
    #[strum(serialize = "Chain verification")]
    Verify,
    #[strum(serialize = "Port binding")]
    Bind,
}

impl Error {
    /// Wraps `self` with the phase and family it occurred in.
    pub fn in_phase(self, family: Family, phase: Phase) -> Self {
        Error::Phase {
            family,
            phase,
            source: Box::new(self),
        }
    }

    /// Returns the failure classification of a packet-filter error, looking
    /// through phase wrappers.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Filter { kind, .. } => Some(*kind),
            Error::Phase { source, .. } => source.kind(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(FailureKind::NotFound)
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind() == Some(FailureKind::Unavailable)
    }

    /// Raw tool message, if this error came from iptables.
    pub fn tool_message(&self) -> Option<&str> {
        match self {
            Error::Filter { message, .. } => Some(message),
            Error::Phase { source, .. } => source.tool_message(),
            _ => None,
        }
    }
}

/// Classifies an iptables/ip6tables stderr message.
///
/// Order matters: legacy iptables reports missing root as
/// "can't initialize iptables table `filter': Permission denied", which must
/// not be mistaken for a missing table.
pub fn classify_failure(stderr: &str) -> FailureKind {
    let lower = stderr.to_lowercase();

    if lower.contains("permission denied")
        || lower.contains("you must be root")
        || lower.contains("operation not permitted")
    {
        return FailureKind::PermissionDenied;
    }

    if lower.contains("can't initialize")
        || lower.contains("do you need to insmod")
        || lower.contains("address family not supported")
        || lower.contains("protocol not supported")
        || lower.contains("command not found")
    {
        return FailureKind::Unavailable;
    }

    if lower.contains("no chain/target/match by that name")
        || lower.contains("does a matching rule exist")
        || lower.contains("bad rule")
        || lower.contains("couldn't load target")
        || (lower.contains("chain") && lower.contains("does not exist"))
    {
        return FailureKind::NotFound;
    }

    if lower.contains("already exists")
        || lower.contains("too many links")
        || lower.contains("directory not empty")
        || lower.contains("resource busy")
    {
        return FailureKind::Conflict;
    }

    FailureKind::Other
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        match classify_failure(msg) {
            FailureKind::PermissionDenied => {
                return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                    .with_suggestion("Run as root, or allow sudo/run0/pkexec for iptables")
                    .with_suggestion("Force a method with ORIGINWALL_ELEVATION_METHOD=sudo")
                    .with_suggestion("Check that CAP_NET_ADMIN is available in this container");
            }
            FailureKind::Unavailable => {
                return ErrorTranslation::new(
                    "Packet filter is not available for this address family",
                )
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Load the kernel modules: sudo modprobe ip_tables ip6_tables")
                .with_suggestion("If IPv6 is disabled on this host, mark ipv6 as not required");
            }
            FailureKind::Conflict if lower.contains("too many links") => {
                return ErrorTranslation::new("Chain is still referenced by another rule")
                    .with_suggestion("Find the reference: sudo iptables -S | grep -- '-j <CHAIN>'")
                    .with_suggestion("Delete the extra jump rule, then run --remove again");
            }
            FailureKind::Conflict => {
                return ErrorTranslation::new("Conflicting chain or rule")
                    .with_suggestion("Another tool may be managing a chain with the same name")
                    .with_suggestion("Pick a different chain name in the allowlist config");
            }
            FailureKind::NotFound | FailureKind::Other => {}
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use CIDR notation: 192.0.2.0/24 or 2001:db8::/32")
                .with_suggestion("Ensure IPv6 ranges are only listed under ipv6");
        }

        if lower.contains("xtables lock") || lower.contains("another app is currently holding") {
            return ErrorTranslation::new("Firewall lock is held by another process")
                .with_suggestion("Another process (kube-proxy, docker) is modifying iptables")
                .with_suggestion("Wait a moment and try again");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the live rules: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
