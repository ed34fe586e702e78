mod formatter;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use formatter::{format_json, format_markdown, format_text};
use hostscan_core::types::{ModuleName, Severity};
use hostscan_core::{ModuleRegistry, Scanner, SystemCommandRunner, ThreatIntel};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostscan")]
#[command(author = "hostscan Contributors")]
#[command(version)]
#[command(about = "Indicator-of-compromise scanner for Linux hosts", long_about = None)]
struct Cli {
    /// Modules to run, comma separated (default: all)
    #[arg(short, long, value_delimiter = ',')]
    modules: Vec<ModuleName>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Load threat intelligence from this directory instead of the built-in data
    #[arg(long, value_name = "DIR")]
    threat_db: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON format
    Json,
    /// JSON with pretty printing
    JsonPretty,
    /// Markdown report
    Markdown,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Check if running as root
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Warning: Not running as root. Some checks may be incomplete.");
        eprintln!("         Run with 'sudo' for full analysis.\n");
    }

    let intel = match &cli.threat_db {
        Some(dir) => ThreatIntel::load_dir(dir)
            .with_context(|| format!("failed to load threat intelligence from {}", dir.display()))?,
        None => ThreatIntel::embedded().context("built-in threat intelligence is invalid")?,
    };
    tracing::info!(stats = ?intel.stats(), "threat intelligence ready");

    let runner = SystemCommandRunner::new()?;
    let scanner = Scanner::new(Arc::new(intel), Arc::new(runner), ModuleRegistry::standard());
    let result = scanner.run(&cli.modules);

    let output = match cli.format {
        OutputFormat::Text => format_text(&result),
        OutputFormat::Json => format_json(&result, false)?,
        OutputFormat::JsonPretty => format_json(&result, true)?,
        OutputFormat::Markdown => format_markdown(&result),
    };

    if let Some(path) = &cli.output {
        std::fs::write(path, output)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    } else {
        print!("{}", output);
    }

    std::process::exit(Severity::exit_code(result.summary.max_severity));
}
