//! Packet-filter abstraction and the iptables/ip6tables backend
//!
//! [`PacketFilter`] is the set of chain and rule operations the applier needs
//! from the host. Production code uses [`IptablesBackend`]; tests use a
//! stateful in-memory mock or the `tests/mock_iptables.sh` script.
//!
//! Every call is a separate process invocation, awaited to completion before
//! the caller issues the next one.

use crate::core::error::{Error, FailureKind, Result, classify_failure};
use crate::core::ruleset::{DispatchBinding, Family, FilterRule, PARENT_CHAIN};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// Chain and rule operations on one address family's filter table.
///
/// Errors from the backend must carry a [`FailureKind`] so the applier can
/// tell "not found" apart from real failures.
#[allow(async_fn_in_trait)]
pub trait PacketFilter {
    fn family(&self) -> Family;

    async fn create_chain(&self, chain: &str) -> Result<()>;

    async fn flush_chain(&self, chain: &str) -> Result<()>;

    async fn delete_chain(&self, chain: &str) -> Result<()>;

    async fn append_rule(&self, chain: &str, rule: &FilterRule) -> Result<()>;

    /// Inserts the binding at the top of the parent chain
    async fn insert_dispatch(&self, binding: &DispatchBinding) -> Result<()>;

    /// Deletes one occurrence of the binding from the parent chain
    async fn delete_dispatch(&self, binding: &DispatchBinding) -> Result<()>;

    /// Deletes one rule of `chain` given its match and target arguments as
    /// `iptables -S` prints them
    async fn delete_rule(&self, chain: &str, args: &[String]) -> Result<()>;

    /// Returns the chain in `iptables -S CHAIN` format
    async fn list_chain(&self, chain: &str) -> Result<String>;

    /// Returns the whole filter table in `iptables -S` format
    async fn list_rules(&self) -> Result<String>;
}

/// [`PacketFilter`] that runs `iptables` or `ip6tables`.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    family: Family,
    program: String,
    leading_args: Vec<String>,
    elevate: bool,
}

impl IptablesBackend {
    /// Backend for `family` using the standard tool, elevated when not root.
    pub fn new(family: Family) -> Self {
        Self {
            family,
            program: family.program().to_string(),
            leading_args: Vec::new(),
            elevate: true,
        }
    }

    /// Runs `program` with `leading_args` in front of every iptables argument
    /// list instead of the standard tool, without elevation. Used for wrappers
    /// such as `nsenter -t 1 -n iptables`.
    pub fn with_command(
        family: Family,
        program: impl Into<String>,
        leading_args: Vec<String>,
    ) -> Self {
        Self {
            family,
            program: program.into(),
            leading_args,
            elevate: false,
        }
    }

    /// Honors `ORIGINWALL_IPTABLES_COMMAND` / `ORIGINWALL_IP6TABLES_COMMAND`.
    ///
    /// The variable is split on whitespace; the first word is the program.
    pub fn from_env(family: Family) -> Self {
        if let Ok(command) = std::env::var(family.command_env()) {
            let mut words = command.split_whitespace().map(String::from);
            if let Some(program) = words.next() {
                debug!("{} overridden by {}: {command}", family, family.command_env());
                return Self::with_command(family, program, words.collect());
            }
        }
        Self::new(family)
    }

    fn command_line(&self, args: &[String]) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.leading_args.iter().map(String::as_str));
        parts.extend(args.iter().map(String::as_str));
        parts.join(" ")
    }

    fn build_command(&self, args: &[String]) -> Result<Command> {
        let mut full: Vec<&str> = self.leading_args.iter().map(String::as_str).collect();
        full.extend(args.iter().map(String::as_str));

        if self.elevate {
            Ok(crate::elevation::create_elevated_filter_command(
                self.family,
                &full,
            )?)
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(full);
            Ok(cmd)
        }
    }

    /// Runs one invocation. `-w` makes iptables wait for the xtables lock.
    async fn run(&self, args: Vec<String>) -> Result<String> {
        let mut args = args;
        args.insert(0, "-w".to_string());
        let command = self.command_line(&args);
        debug!("Running {command}");

        let output = match self
            .build_command(&args)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("Failed to spawn {}: {e}", self.program);
                return Err(Error::Filter {
                    command,
                    kind: FailureKind::Unavailable,
                    message: format!("{} not found: {e}", self.program),
                    exit_code: None,
                });
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let kind = classify_failure(&stderr);
            debug!("{command} exited with {:?} ({kind}): {stderr}", output.status.code());
            Err(Error::Filter {
                command,
                kind,
                message: stderr,
                exit_code: output.status.code(),
            })
        }
    }
}

fn chain_args(op: &str, chain: &str) -> Vec<String> {
    vec![op.to_string(), chain.to_string()]
}

impl PacketFilter for IptablesBackend {
    fn family(&self) -> Family {
        self.family
    }

    async fn create_chain(&self, chain: &str) -> Result<()> {
        self.run(chain_args("-N", chain)).await.map(drop)
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        self.run(chain_args("-F", chain)).await.map(drop)
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.run(chain_args("-X", chain)).await.map(drop)
    }

    async fn append_rule(&self, chain: &str, rule: &FilterRule) -> Result<()> {
        let mut args = chain_args("-A", chain);
        args.extend(rule.match_args());
        self.run(args).await.map(drop)
    }

    async fn insert_dispatch(&self, binding: &DispatchBinding) -> Result<()> {
        let mut args = chain_args("-I", PARENT_CHAIN);
        args.extend(binding.match_args());
        self.run(args).await.map(drop)
    }

    async fn delete_dispatch(&self, binding: &DispatchBinding) -> Result<()> {
        let mut args = chain_args("-D", PARENT_CHAIN);
        args.extend(binding.match_args());
        self.run(args).await.map(drop)
    }

    async fn delete_rule(&self, chain: &str, args: &[String]) -> Result<()> {
        let mut full = chain_args("-D", chain);
        full.extend_from_slice(args);
        self.run(full).await.map(drop)
    }

    async fn list_chain(&self, chain: &str) -> Result<String> {
        self.run(chain_args("-S", chain)).await
    }

    async fn list_rules(&self) -> Result<String> {
        self.run(vec!["-S".to_string()]).await
    }
}
