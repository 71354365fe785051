//! Strata - layer cache engine for staged image builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::{commands, Cli, Commands};
use strata::config::{Config, ConfigManager};
use strata::error::StrataResult;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StrataResult<()> {
    let cli = Cli::parse();

    // Completions need neither config nor logging
    if let Commands::Completions { shell } = cli.command {
        commands::completions(shell);
        return Ok(());
    }

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;

    init_logging(cli.verbose, &config);
    strata::ui::init_theme();
    debug!("Using config {}", manager.path().display());

    match cli.command {
        Commands::Completions { .. } => unreachable!("completions handled above"),
        Commands::Build(args) => commands::build(args, &config).await,
        Commands::Cache(args) => commands::cache(args, &config).await,
        Commands::Config(args) => commands::config(args, &manager, &config).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set.
/// Logs go to stderr so `--format json` output stays parseable.
fn init_logging(verbose: u8, config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("strata=warn"),
        1 => EnvFilter::new("strata=info"),
        _ => EnvFilter::new("strata=debug"),
    });

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}
