//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Strata - content-addressed layer cache for staged image builds
///
/// Fingerprints every build step from its inputs and its parent layer,
/// reusing cached layers until the first changed step.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the stages of a build file against the layer cache
    Build(BuildArgs),

    /// Inspect and maintain the layer cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Build file (defaults to strata.toml in the context directory)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Build context directory that copied files are read from
    #[arg(long, default_value = ".")]
    pub context: PathBuf,

    /// Stage forming the output image (overrides the build file)
    #[arg(long)]
    pub target: Option<String>,

    /// Report hits and misses without touching the cache
    #[arg(long)]
    pub dry_run: bool,

    /// Cancel remaining stages as soon as one fails
    #[arg(long)]
    pub fail_fast: bool,

    /// Build stages one at a time
    #[arg(long)]
    pub sequential: bool,

    /// Cancel the build after N seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

impl BuildArgs {
    /// Resolve the build file path against the context
    pub fn buildfile(&self) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| self.context.join(crate::build::DEFAULT_BUILDFILE))
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., build.fail_fast)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for reports and listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Bare fingerprints, one per line
    Plain,
}

impl OutputFormat {
    /// Whether the output is meant for other programs
    pub fn is_machine(self) -> bool {
        !matches!(self, Self::Table)
    }
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached layers
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show a layer and the chain of parents below it
    Inspect {
        /// Fingerprint or unique prefix
        fingerprint: String,
    },

    /// Evict layers by age, count and size
    Prune {
        /// Keep at most N layers, 0 for no limit (default: from config)
        #[arg(long)]
        max_entries: Option<usize>,

        /// Keep at most N MB of layers, 0 for no limit (default: from config)
        #[arg(long)]
        max_mb: Option<u64>,

        /// Remove layers unused for N days, 0 for no limit (default: from config)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Recompute every fingerprint and report corrupt entries
    Verify,

    /// Remove every cached layer
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the cache file path
    Path,
}
