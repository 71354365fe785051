//! Build step model
//!
//! A step is one instruction of a stage. Its declared inputs are what the
//! fingerprint is computed from; anything not declared cannot invalidate
//! the cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a build step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Start from a base image tag
    BaseImage,
    /// Copy files from the build context or another stage
    CopyFiles,
    /// Run a shell command
    RunCommand,
    /// Image metadata (labels, env, exposed ports)
    Metadata,
}

impl StepKind {
    /// Stable name used in reports and fingerprints
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BaseImage => "base-image",
            Self::CopyFiles => "copy-files",
            Self::RunCommand => "run-command",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed step instruction with its declared inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Instruction {
    /// `FROM <image>`
    BaseImage { image: String },

    /// `COPY [--from=<stage>] <files>`
    CopyFiles {
        files: Vec<String>,

        /// Copy out of a previously built stage instead of the context
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,

        /// Declared size for copies out of another stage
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<u64>,
    },

    /// `RUN <command>`
    RunCommand {
        command: String,

        /// Declared layer size in bytes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<u64>,
    },

    /// `LABEL` / `ENV` / `EXPOSE` style key-value metadata
    Metadata {
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
}

impl Instruction {
    /// The step kind of this instruction
    pub fn kind(&self) -> StepKind {
        match self {
            Self::BaseImage { .. } => StepKind::BaseImage,
            Self::CopyFiles { .. } => StepKind::CopyFiles,
            Self::RunCommand { .. } => StepKind::RunCommand,
            Self::Metadata { .. } => StepKind::Metadata,
        }
    }

    /// Stage this instruction copies from, if any
    pub fn stage_reference(&self) -> Option<&str> {
        match self {
            Self::CopyFiles {
                from: Some(stage), ..
            } => Some(stage.as_str()),
            _ => None,
        }
    }

    /// Short human-readable description for build logs
    pub fn describe(&self) -> String {
        match self {
            Self::BaseImage { image } => image.clone(),
            Self::CopyFiles { files, from, .. } => {
                let list = files.join(" ");
                match from {
                    Some(stage) => format!("--from={} {}", stage, list),
                    None => list,
                }
            }
            Self::RunCommand { command, .. } => command.clone(),
            Self::Metadata { labels } => labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// An instruction at a fixed position within its stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    /// Position in the stage, starting at 0
    pub index: usize,
    /// What the step does
    pub instruction: Instruction,
}

impl BuildStep {
    /// The step kind
    pub fn kind(&self) -> StepKind {
        self.instruction.kind()
    }
}
