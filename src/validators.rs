//! Input validation for allowlist configuration
//!
//! Everything that ends up on an iptables command line is checked here
//! before any command is run.

use crate::core::ruleset::{AddressRange, Family};

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN` - 1).
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Built-in chains and targets a custom chain must not shadow.
const RESERVED_CHAIN_NAMES: &[&str] = &[
    "INPUT",
    "OUTPUT",
    "FORWARD",
    "PREROUTING",
    "POSTROUTING",
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "QUEUE",
    "LOG",
];

/// Validates a custom chain name.
///
/// # Examples
///
/// ```
/// use originwall::validators::validate_chain_name;
///
/// assert!(validate_chain_name("ORIGIN_ALLOWLIST").is_ok());
/// assert!(validate_chain_name("INPUT").is_err());
/// assert!(validate_chain_name("has space").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, starts with `-`, contains
/// characters outside `[A-Za-z0-9_-]`, or names a built-in chain or target.
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if name.starts_with('-') {
        return Err("Chain name cannot start with '-'".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err("Chain name contains invalid characters (use A-Z, 0-9, _, -)".to_string());
    }

    if RESERVED_CHAIN_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
    {
        return Err(format!("'{name}' is a built-in chain or target"));
    }

    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates the protected port list: non-empty, non-zero, no duplicates.
///
/// A duplicate port would produce two entry points for the same port.
///
/// # Errors
///
/// Returns `Err` describing the first problem found.
pub fn validate_ports(ports: &[u16]) -> Result<(), String> {
    if ports.is_empty() {
        return Err("At least one port must be protected".to_string());
    }

    for (i, &port) in ports.iter().enumerate() {
        validate_port(port)?;
        if ports[..i].contains(&port) {
            return Err(format!("Port {port} is listed more than once"));
        }
    }

    Ok(())
}

/// Validates that a range belongs to `family` and has no host bits set.
///
/// iptables normalizes `10.42.1.7/16` to `10.42.0.0/16`, so a non-canonical
/// range would never match the live listing during verification.
///
/// # Errors
///
/// Returns `Err` on a family mismatch or a non-canonical range.
pub fn validate_range(range: &AddressRange, family: Family) -> Result<(), String> {
    if range.family() != family {
        return Err(format!("{range} is not an {family} range"));
    }

    let network = range.network();
    if network.ip() != network.network() {
        return Err(format!(
            "{range} has host bits set (did you mean {}/{}?)",
            network.network(),
            network.prefix()
        ));
    }

    Ok(())
}
