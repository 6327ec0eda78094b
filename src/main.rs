//! originwall - origin allowlist firewall
//!
//! Limits ports 80 and 443 to the reverse proxy's published ranges plus
//! loopback and the local cluster networks, for IPv4 and IPv6.
//!
//! # Usage
//!
//! ```bash
//! originwall                 # Show the plan (same as --dry-run)
//! originwall --dry-run       # Show the plan, change nothing
//! originwall --apply         # Replace the allowlist chain and bind it
//! originwall --remove        # Unbind and delete the allowlist chain
//! originwall --apply -c /srv/allowlist.json -v
//! ```

use clap::{ArgGroup, Parser};
use originwall::config;
use originwall::core::error::IptablesErrorPattern;
use originwall::core::filter::IptablesBackend;
use originwall::core::pipeline::{self, Mode, RunReport};
use originwall::core::plan::Plan;
use originwall::core::ruleset::Family;
use std::path::PathBuf;
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tracing::Level;

#[derive(Parser)]
#[command(name = "originwall")]
#[command(version, about = "Idempotent iptables allowlist for reverse-proxied web origins", long_about = None)]
#[command(group(ArgGroup::new("mode").args(["apply", "dry_run", "remove"])))]
struct Cli {
    /// Replace the allowlist chain and bind it to the protected ports
    #[arg(long)]
    apply: bool,
    /// Print the plan without changing anything (default)
    #[arg(long)]
    dry_run: bool,
    /// Unbind and delete the allowlist chain
    #[arg(long)]
    remove: bool,
    /// Allowlist file (default: XDG config, /etc/originwall, then built-in)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.apply {
            Mode::Apply
        } else if self.remove {
            Mode::Remove
        } else {
            Mode::DryRun
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    // Unknown arguments and conflicting modes print usage and exit non-zero here
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every required step succeeded.
async fn run(cli: &Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let (config, source) = config::load_allowlist(cli.config.as_deref()).await?;
    tracing::info!("Using {source}");

    let families: Vec<Family> = Family::iter().collect();

    match cli.mode() {
        Mode::DryRun => {
            let plan = Plan::from_config(&config, &families)?;
            print!("{}", plan.render());
            Ok(true)
        }
        Mode::Apply => {
            let plan = Plan::from_config(&config, &families)?;
            let filters = backends(&families);
            let report = pipeline::apply_all(&config, &filters, Some(plan.short_digest())).await;
            Ok(finish(&report))
        }
        Mode::Remove => {
            let filters = backends(&families);
            let report = pipeline::remove_all(&config, &filters).await;
            Ok(finish(&report))
        }
    }
}

fn backends(families: &[Family]) -> Vec<IptablesBackend> {
    families.iter().map(|&f| IptablesBackend::from_env(f)).collect()
}

/// Prints the report on stdout and every failure, with hints, on stderr.
fn finish(report: &RunReport) -> bool {
    println!("{report}");

    for (family, err) in report.failures() {
        eprintln!("\n✗ {family}: {err}");
        if let Some(message) = err.tool_message() {
            let translation = IptablesErrorPattern::match_error(message);
            eprintln!("  {}", translation.user_message);
            for suggestion in &translation.suggestions {
                eprintln!("  - {suggestion}");
            }
        }
    }

    report.succeeded()
}
