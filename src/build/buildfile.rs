//! Build file parsing
//!
//! A build is described by a `strata.toml` file listing stages and their
//! steps in order:
//!
//! ```toml
//! target = "app"
//!
//! [[stage]]
//! name = "app"
//!
//! [[stage.step]]
//! kind = "base-image"
//! image = "node:18-alpine"
//! ```

use crate::build::graph::{BuildGraph, BuildPlan};
use crate::build::step::Instruction;
use crate::error::{StrataError, StrataResult};
use serde::Deserialize;
use std::path::Path;

/// Default build file name looked up in the context directory
pub const DEFAULT_BUILDFILE: &str = "strata.toml";

/// Parsed build file
#[derive(Debug, Clone, Deserialize)]
pub struct BuildFile {
    /// Stage forming the output image (defaults to the last stage)
    #[serde(default)]
    pub target: Option<String>,

    /// Stages in definition order
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageSpec>,
}

/// One `[[stage]]` table
#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    /// Stage name (unique within the file)
    pub name: String,

    /// Steps in execution order
    #[serde(default, rename = "step")]
    pub steps: Vec<Instruction>,
}

impl BuildFile {
    /// Parse a build file from disk
    pub async fn from_file(path: &Path) -> StrataResult<Self> {
        if !path.exists() {
            return Err(StrataError::BuildfileNotFound(path.to_path_buf()));
        }
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            StrataError::io(format!("reading build file {}", path.display()), e)
        })?;
        Self::parse_at(&content, path)
    }

    /// Parse a build file from a TOML string
    pub fn parse(content: &str) -> StrataResult<Self> {
        Self::parse_at(content, Path::new(DEFAULT_BUILDFILE))
    }

    fn parse_at(content: &str, path: &Path) -> StrataResult<Self> {
        let file: Self = toml::from_str(content)
            .map_err(|e| StrataError::buildfile(path, e.to_string()))?;
        file.check_steps(path)?;
        Ok(file)
    }

    /// Per-step checks that do not depend on other stages
    fn check_steps(&self, path: &Path) -> StrataResult<()> {
        for stage in &self.stages {
            for (index, step) in stage.steps.iter().enumerate() {
                let problem = match step {
                    Instruction::BaseImage { image } if image.trim().is_empty() => {
                        Some("base image cannot be empty")
                    }
                    Instruction::CopyFiles { files, .. } if files.is_empty() => {
                        Some("copy-files needs at least one file")
                    }
                    Instruction::CopyFiles { files, .. }
                        if files.iter().any(|f| f.trim().is_empty()) =>
                    {
                        Some("copy-files paths cannot be empty")
                    }
                    Instruction::CopyFiles {
                        from: Some(stage), ..
                    } if stage.trim().is_empty() => Some("`from` cannot be empty"),
                    Instruction::RunCommand { command, .. } if command.trim().is_empty() => {
                        Some("command cannot be empty")
                    }
                    _ => None,
                };

                if let Some(reason) = problem {
                    return Err(StrataError::buildfile(
                        path,
                        format!("stage '{}' step {}: {}", stage.name, index, reason),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Convert into a validated build plan
    pub fn into_plan(self, path: &Path) -> StrataResult<BuildPlan> {
        let stages = self
            .stages
            .into_iter()
            .map(|s| BuildGraph::new(s.name, s.steps))
            .collect();
        BuildPlan::validated(stages, self.target, path)
    }
}

/// Load a build file and turn it into a plan
pub async fn load_plan(path: &Path) -> StrataResult<BuildPlan> {
    BuildFile::from_file(path).await?.into_plan(path)
}
