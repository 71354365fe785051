//! Build planning and execution
//!
//! ```text
//! strata.toml ──parse──▶ BuildPlan ──waves──▶ Engine ──▶ BuildReport
//!                                               │
//!                                               ▼
//!                                          CacheStore
//! ```

pub mod buildfile;
pub mod engine;
pub mod fingerprint;
pub mod graph;
pub mod report;
pub mod step;

pub use buildfile::{load_plan, BuildFile, StageSpec, DEFAULT_BUILDFILE};
pub use engine::{BuildOptions, CancelToken, CostModel, Engine, StepEvent, StepObserver};
pub use fingerprint::{Fingerprint, ResolvedInput};
pub use graph::{BuildGraph, BuildPlan, StageScope};
pub use report::{
    BuildReport, CacheStatus, FailureKind, Image, StageReport, StepFailure, StepRecord, Summary,
};
pub use step::{BuildStep, Instruction, StepKind};
