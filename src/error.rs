//! Error types for Strata
//!
//! All modules use `StrataResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// All errors that can occur in Strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Build errors
    #[error("Unresolved dependency in stage '{stage}' step {index} ({kind}): {reference}")]
    Dependency {
        stage: String,
        index: usize,
        kind: String,
        reference: String,
    },

    #[error("Failed to hash {path}: {reason}")]
    HashComputation { path: PathBuf, reason: String },

    #[error("Cache entry {stored} is corrupt (recomputed fingerprint {recomputed})")]
    CacheCorruption { stored: String, recomputed: String },

    #[error("Cache entry #{position} is malformed: {reason}")]
    CacheEntryMalformed { position: usize, reason: String },

    #[error("Build cancelled before stage '{stage}' step {index}")]
    Cancelled { stage: String, index: usize },

    #[error("Invalid build file {path}: {reason}")]
    BuildfileInvalid { path: PathBuf, reason: String },

    #[error("Build file not found: {0}")]
    BuildfileNotFound(PathBuf),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    // Cache errors
    #[error("Unsupported cache format version {found} in {path} (expected {expected})")]
    CacheVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("No cache entry matches '{0}'")]
    LayerNotFound(String),

    #[error("Fingerprint prefix '{0}' is ambiguous")]
    AmbiguousFingerprint(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a dependency error for a step
    pub fn dependency(
        stage: impl Into<String>,
        index: usize,
        kind: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self::Dependency {
            stage: stage.into(),
            index,
            kind: kind.into(),
            reference: reference.into(),
        }
    }

    /// Create a build file validation error
    pub fn buildfile(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::BuildfileInvalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error aborts only the graph it occurred in
    pub fn is_graph_local(&self) -> bool {
        matches!(
            self,
            Self::Dependency { .. } | Self::HashComputation { .. } | Self::Cancelled { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BuildfileNotFound(_) => Some("Pass --file or create strata.toml"),
            Self::Dependency { .. } => {
                Some("Stages must be defined before they are referenced with `from`")
            }
            Self::CacheVersion { .. } => Some("Run: strata cache clear"),
            Self::AmbiguousFingerprint(_) => Some("Use a longer fingerprint prefix"),
            Self::Cancelled { .. } => Some("Increase --timeout or build.timeout_secs"),
            _ => None,
        }
    }
}
