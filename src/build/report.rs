//! Build reports
//!
//! The report is the observable output of a build: one record per executed
//! step, a terminal error entry if a stage aborted, the output image when
//! every stage succeeded, and aggregate totals.

use crate::build::fingerprint::Fingerprint;
use crate::build::step::StepKind;
use crate::cache::evict::sum_bytes;
use crate::error::StrataError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Whether a step reused a cached layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Miss => write!(f, "MISS"),
        }
    }
}

/// One executed step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub kind: StepKind,
    pub description: String,
    pub status: CacheStatus,
    pub fingerprint: Fingerprint,
    pub parent: Option<Fingerprint>,
    pub size_bytes: u64,
}

/// Category of a stage abort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Dependency,
    HashComputation,
    Cancelled,
    Internal,
}

/// Terminal error entry for an aborted stage
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub stage: String,
    pub index: usize,
    pub kind: Option<StepKind>,
    pub category: FailureKind,
    pub message: String,
}

impl StepFailure {
    /// Build a failure entry from an engine error
    pub fn from_error(
        stage: impl Into<String>,
        index: usize,
        kind: Option<StepKind>,
        err: &StrataError,
    ) -> Self {
        let category = match err {
            StrataError::Dependency { .. } => FailureKind::Dependency,
            StrataError::HashComputation { .. } => FailureKind::HashComputation,
            StrataError::Cancelled { .. } => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        };
        Self {
            stage: stage.into(),
            index,
            kind,
            category,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(
                f,
                "stage '{}' step {} ({}): {}",
                self.stage, self.index, kind, self.message
            ),
            None => write!(f, "stage '{}': {}", self.stage, self.message),
        }
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub steps: Vec<StepRecord>,
    pub final_fingerprint: Option<Fingerprint>,
    pub failure: Option<StepFailure>,
    /// Whether the stage contributes layers to the output image
    pub in_image: bool,
}

impl StageReport {
    /// An empty report for a stage about to run
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            final_fingerprint: None,
            failure: None,
            in_image: false,
        }
    }

    /// A report for a stage that aborted before executing any step
    pub fn aborted(name: impl Into<String>, failure: StepFailure) -> Self {
        let mut report = Self::new(name);
        report.failure = Some(failure);
        report
    }

    /// Whether every step of the stage executed
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Number of cache hits
    pub fn hits(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == CacheStatus::Hit)
            .count()
    }

    /// Number of cache misses
    pub fn misses(&self) -> usize {
        self.steps.len() - self.hits()
    }
}

/// The output artifact: the target stage's layer stack
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub target: String,
    pub fingerprint: Fingerprint,
    /// Layers from the base image up
    pub layers: Vec<Fingerprint>,
    pub size_bytes: u64,
}

/// Aggregate totals over every executed step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub steps: usize,
    pub hits: usize,
    pub misses: usize,
    /// Distinct layers touched by the build
    pub layers: usize,
    /// Size of the distinct layers (a layer shared by stages counts once)
    pub size_bytes: u64,
}

impl Summary {
    /// Compute totals from stage reports
    pub fn from_stages(stages: &[StageReport]) -> Self {
        let mut distinct: HashMap<&Fingerprint, u64> = HashMap::new();
        let mut summary = Self::default();

        for stage in stages {
            summary.hits += stage.hits();
            summary.misses += stage.misses();
            summary.steps += stage.steps.len();
            for step in &stage.steps {
                distinct.entry(&step.fingerprint).or_insert(step.size_bytes);
            }
        }

        summary.layers = distinct.len();
        summary.size_bytes = sum_bytes(distinct.values().copied());
        summary
    }
}

/// Full result of one build
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub target: String,
    pub dry_run: bool,
    /// Stages in definition order
    pub stages: Vec<StageReport>,
    /// Present only when every stage succeeded
    pub image: Option<Image>,
    pub summary: Summary,
    /// First stage failure in definition order
    pub error: Option<StepFailure>,
}

impl BuildReport {
    /// Whether the build produced an image
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Look up a stage's report by name
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Hit/miss of each step of a stage, in order
    pub fn statuses(&self, stage: &str) -> Vec<CacheStatus> {
        self.stage(stage)
            .map(|s| s.steps.iter().map(|r| r.status).collect())
            .unwrap_or_default()
    }
}
