//! Configuration schema for Strata
//!
//! Configuration is stored at `~/.config/strata/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Layer cache settings
    pub cache: CacheConfig,

    /// Layer size cost model
    pub cost: CostConfig,

    /// Build execution settings
    pub build: BuildConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Append a line to the build history log after every build
    pub history_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            history_log: true,
        }
    }
}

/// Layer cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache file location (defaults to the state directory)
    pub path: Option<PathBuf>,

    /// Prune with the eviction policy after every build, before flushing
    pub auto_prune: bool,

    /// Eviction bounds
    pub eviction: EvictionConfig,
}

/// Eviction bounds (0 disables a bound)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Maximum number of cached layers
    pub max_entries: usize,

    /// Maximum total size of cached layers in MB
    pub max_total_mb: u64,

    /// Remove layers not used for N days
    pub max_age_days: u32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_total_mb: 20 * 1024,
            max_age_days: 30,
        }
    }
}

/// Size assigned to synthesized layers, per step kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Size of a base image layer
    pub base_image_bytes: u64,

    /// Size of a run-command layer without a declared cost
    pub run_command_bytes: u64,

    /// Size of a metadata layer
    pub metadata_bytes: u64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            base_image_bytes: 80 * 1024 * 1024,
            run_command_bytes: 10 * 1024 * 1024,
            metadata_bytes: 0,
        }
    }
}

/// Build execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Run independent stages concurrently
    pub parallel_stages: bool,

    /// Cancel sibling stages when one stage fails
    pub fail_fast: bool,

    /// Cancel the build after N seconds (0 = no timeout)
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallel_stages: true,
            fail_fast: false,
            timeout_secs: 0,
        }
    }
}
