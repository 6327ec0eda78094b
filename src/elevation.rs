//! Privilege elevation for packet-filter commands
//!
//! originwall is usually run as root from provisioning scripts. When it is
//! not, each `iptables`/`ip6tables` invocation is wrapped in an elevation
//! helper. Only those two binaries can be elevated.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `ORIGINWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules in automation.
//!   Example: `ORIGINWALL_ELEVATION_METHOD=sudo originwall --apply`
//!
//! - `ORIGINWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Elevation binaries are checked for availability before use

use crate::core::ruleset::Family;
use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - run as root or install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `ORIGINWALL_ELEVATION_METHOD`
    #[error("Invalid ORIGINWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(helper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Internal helper to build an elevated command for a specific program.
///
/// Not exposed publicly; callers go through [`create_elevated_filter_command`]
/// so only the packet-filter tools can be elevated.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("ORIGINWALL_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("ORIGINWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (no SUID), fallback to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

/// Creates an elevated `iptables` or `ip6tables` command for `family`
///
/// # Arguments
///
/// * `family` - Selects `iptables` (IPv4) or `ip6tables` (IPv6)
/// * `args` - Command-line arguments to pass to the tool
///
/// # Security
///
/// Arguments are passed directly without shell interpretation.
///
/// # Testing
///
/// Set `ORIGINWALL_TEST_NO_ELEVATION=1` to run the tool directly.
pub fn create_elevated_filter_command(
    family: Family,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(family.program(), args)
}
