//! Layer cache engine
//!
//! Walks each stage's steps in order, fingerprinting every step on top of
//! the previous step's layer and either reusing the cached layer (hit) or
//! synthesizing and inserting a new one (miss). Once a step misses, every
//! later step in the stage sees a parent it has not been built on before,
//! so misses propagate to the end of the stage.
//!
//! Stages without `--from` edges between them run as concurrent tasks and
//! meet only at the shared `CacheStore`.

use crate::build::fingerprint::{Fingerprint, ResolvedInput};
use crate::build::graph::{BuildGraph, BuildPlan, StageScope};
use crate::build::report::{
    BuildReport, CacheStatus, Image, StageReport, StepFailure, StepRecord, Summary,
};
use crate::build::step::{BuildStep, Instruction, StepKind};
use crate::cache::evict::sum_bytes;
use crate::cache::store::{CacheStore, InsertOutcome, Layer};
use crate::config::schema::{BuildConfig, CostConfig};
use crate::error::{StrataError, StrataResult};
use crate::hash::ContentHasher;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Layer sizes assigned to misses, per step kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostModel {
    pub base_image_bytes: u64,
    pub run_command_bytes: u64,
    pub metadata_bytes: u64,
}

impl From<&CostConfig> for CostModel {
    fn from(config: &CostConfig) -> Self {
        Self {
            base_image_bytes: config.base_image_bytes,
            run_command_bytes: config.run_command_bytes,
            metadata_bytes: config.metadata_bytes,
        }
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::from(&CostConfig::default())
    }
}

/// How a build runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run independent stages concurrently
    pub parallel_stages: bool,
    /// Cancel the remaining stages as soon as one fails
    pub fail_fast: bool,
    /// Decide hits and misses without inserting into the store
    pub dry_run: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            parallel_stages: true,
            fail_fast: false,
            dry_run: false,
        }
    }
}

impl From<&BuildConfig> for BuildOptions {
    fn from(config: &BuildConfig) -> Self {
        Self {
            parallel_stages: config.parallel_stages,
            fail_fast: config.fail_fast,
            dry_run: false,
        }
    }
}

/// Cooperative cancellation, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Cancel after `timeout`; abort the handle to disarm
    pub fn cancel_after(&self, timeout: Duration) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("Build timed out after {}s", timeout.as_secs());
            token.cancel();
        })
    }
}

/// Emitted after each executed step, for progress display
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub stage: String,
    pub index: usize,
    pub kind: StepKind,
    pub status: CacheStatus,
    pub fingerprint: Fingerprint,
}

/// Receives a `StepEvent` after each executed step.
///
/// Called inline before the next step's cancellation check, so an observer
/// that cancels the build stops it at the following step.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, event: StepEvent);
}

impl StepObserver for UnboundedSender<StepEvent> {
    fn on_step(&self, event: StepEvent) {
        // The receiver going away only stops progress output
        let _ = self.send(event);
    }
}

/// The layer cache engine
#[derive(Clone)]
pub struct Engine {
    store: Arc<CacheStore>,
    hasher: Arc<dyn ContentHasher>,
    cost: CostModel,
    observer: Option<Arc<dyn StepObserver>>,
}

impl Engine {
    /// Create an engine over a shared store and a content hasher
    pub fn new(store: Arc<CacheStore>, hasher: Arc<dyn ContentHasher>) -> Self {
        Self {
            store,
            hasher,
            cost: CostModel::default(),
            observer: None,
        }
    }

    /// Use a specific cost model
    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    /// Send a `StepEvent` for every executed step
    pub fn with_events(self, events: UnboundedSender<StepEvent>) -> Self {
        self.with_observer(Arc::new(events))
    }

    /// Report every executed step to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The shared layer store
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Build every stage of a plan and assemble the report.
    ///
    /// A failing stage aborts only itself (and the stages that copy from
    /// it) unless `fail_fast` is set. The image is produced only when every
    /// stage succeeded.
    pub async fn build(
        &self,
        plan: &BuildPlan,
        options: &BuildOptions,
        cancel: &CancelToken,
    ) -> BuildReport {
        let build_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            "Build {} started: {} stage(s), target '{}'",
            build_id,
            plan.stages().len(),
            plan.target()
        );

        let waves = if options.parallel_stages {
            plan.waves()
        } else {
            (0..plan.stages().len()).map(|i| vec![i]).collect()
        };

        let mut reports: Vec<Option<StageReport>> = (0..plan.stages().len()).map(|_| None).collect();
        let mut completed: HashMap<String, Fingerprint> = HashMap::new();

        for wave in waves {
            let finished = if wave.len() > 1 {
                self.run_concurrent(plan, &wave, &completed, options, cancel)
                    .await
            } else {
                let mut finished = Vec::with_capacity(wave.len());
                for &position in &wave {
                    let scope = StageScope::new(plan, position, &completed);
                    let graph = &plan.stages()[position];
                    let report = self.run_stage(graph, &scope, options, cancel).await;
                    finished.push((position, report));
                }
                finished
            };

            for (position, report) in finished {
                if let (true, Some(fp)) = (report.is_success(), &report.final_fingerprint) {
                    completed.insert(report.name.clone(), fp.clone());
                }
                reports[position] = Some(report);
            }
        }

        let mut stages: Vec<StageReport> = reports.into_iter().flatten().collect();
        let required = plan.required_stages();
        for stage in &mut stages {
            stage.in_image = required.contains(&stage.name);
        }

        let error = stages.iter().find_map(|s| s.failure.clone());
        let image = match error {
            Some(_) => None,
            None => stages
                .iter()
                .find(|s| s.name == plan.target())
                .and_then(assemble_image),
        };
        let summary = Summary::from_stages(&stages);

        match (&image, &error) {
            (Some(image), _) => info!(
                "Build {} finished: image {} ({} hit(s), {} miss(es))",
                build_id,
                image.fingerprint.short(),
                summary.hits,
                summary.misses
            ),
            (None, Some(failure)) => warn!("Build {} failed: {}", build_id, failure),
            (None, None) => warn!("Build {} produced no image", build_id),
        }

        BuildReport {
            build_id,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            target: plan.target().to_string(),
            dry_run: options.dry_run,
            stages,
            image,
            summary,
            error,
        }
    }

    /// Run the stages of one wave as concurrent tasks
    async fn run_concurrent(
        &self,
        plan: &BuildPlan,
        wave: &[usize],
        completed: &HashMap<String, Fingerprint>,
        options: &BuildOptions,
        cancel: &CancelToken,
    ) -> Vec<(usize, StageReport)> {
        let handles: Vec<JoinHandle<StageReport>> = wave
            .iter()
            .map(|&position| {
                let engine = self.clone();
                let graph = plan.stages()[position].clone();
                let scope = StageScope::new(plan, position, completed);
                let options = options.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { engine.run_stage(&graph, &scope, &options, &cancel).await })
            })
            .collect();

        futures_util::future::join_all(handles)
            .await
            .into_iter()
            .zip(wave)
            .map(|(joined, &position)| {
                let report = joined.unwrap_or_else(|e| {
                    let name = plan.stages()[position].name.clone();
                    let err = StrataError::Internal(format!("stage task failed: {}", e));
                    StageReport::aborted(name.clone(), StepFailure::from_error(name, 0, None, &err))
                });
                (position, report)
            })
            .collect()
    }

    async fn run_stage(
        &self,
        graph: &BuildGraph,
        scope: &StageScope,
        options: &BuildOptions,
        cancel: &CancelToken,
    ) -> StageReport {
        let report = self.build_stage(graph, scope, cancel, options.dry_run).await;
        if options.fail_fast && !report.is_success() {
            cancel.cancel();
        }
        report
    }

    /// Build one stage.
    ///
    /// Every declared input is resolved before the first step executes, so
    /// an unresolvable input aborts the stage without caching any layer.
    pub async fn build_stage(
        &self,
        graph: &BuildGraph,
        scope: &StageScope,
        cancel: &CancelToken,
        dry_run: bool,
    ) -> StageReport {
        let mut report = StageReport::new(&graph.name);

        if cancel.is_cancelled() {
            report.failure = Some(cancelled(graph, 0));
            return report;
        }

        let mut resolved = Vec::with_capacity(graph.steps.len());
        for step in &graph.steps {
            match self.resolve_step(&graph.name, step, scope).await {
                Ok(inputs) => resolved.push(inputs),
                Err(e) => {
                    warn!("Stage '{}' aborted: {}", graph.name, e);
                    report.failure = Some(StepFailure::from_error(
                        &graph.name,
                        step.index,
                        Some(step.kind()),
                        &e,
                    ));
                    return report;
                }
            }
        }

        let mut parent: Option<Fingerprint> = None;
        for (step, (inputs, size_bytes)) in graph.steps.iter().zip(resolved) {
            if cancel.is_cancelled() {
                warn!("Stage '{}' cancelled before step {}", graph.name, step.index);
                report.failure = Some(cancelled(graph, step.index));
                return report;
            }

            let candidate = Layer::new(step.kind(), inputs, parent.clone(), size_bytes);
            let (layer, status) = if dry_run {
                match self.store.peek(&candidate.fingerprint).await {
                    Some(cached) => (cached, CacheStatus::Hit),
                    None => (Arc::new(candidate), CacheStatus::Miss),
                }
            } else {
                match self.store.get_or_insert(candidate).await {
                    (layer, InsertOutcome::Inserted) => (layer, CacheStatus::Miss),
                    (layer, InsertOutcome::AlreadyPresent) => (layer, CacheStatus::Hit),
                }
            };

            debug!(
                "[{}] #{} {} {} {}",
                graph.name,
                step.index,
                step.kind(),
                status,
                layer.fingerprint.short()
            );
            self.emit(&graph.name, step, status, &layer.fingerprint);

            report.steps.push(StepRecord {
                index: step.index,
                kind: step.kind(),
                description: step.instruction.describe(),
                status,
                fingerprint: layer.fingerprint.clone(),
                parent: layer.parent.clone(),
                size_bytes: layer.size_bytes,
            });
            parent = Some(layer.fingerprint.clone());
        }

        report.final_fingerprint = parent;
        report
    }

    /// Turn a step's declared inputs into content identifiers and a size
    async fn resolve_step(
        &self,
        stage: &str,
        step: &BuildStep,
        scope: &StageScope,
    ) -> StrataResult<(Vec<ResolvedInput>, u64)> {
        let kind = step.kind();

        match &step.instruction {
            Instruction::BaseImage { image } => Ok((
                vec![ResolvedInput::Image {
                    tag: image.trim().to_string(),
                }],
                self.cost.base_image_bytes,
            )),

            Instruction::CopyFiles {
                files,
                from: Some(source),
                cost,
            } => {
                let from = scope
                    .resolve(source)
                    .map_err(|reason| StrataError::dependency(stage, step.index, kind.as_str(), reason))?;
                let inputs = files
                    .iter()
                    .map(|path| ResolvedInput::StageFile {
                        from: from.clone(),
                        path: path.clone(),
                    })
                    .collect();
                Ok((inputs, cost.unwrap_or(0)))
            }

            Instruction::CopyFiles {
                files, from: None, ..
            } => {
                let unique: BTreeSet<&String> = files.iter().collect();
                let mut inputs = Vec::with_capacity(unique.len());
                let mut size = 0u64;

                for path in unique {
                    let digest = self
                        .hasher
                        .digest(path)
                        .await
                        .map_err(|f| f.into_error(stage, step.index, kind.as_str(), path))?;
                    size = size.saturating_add(digest.size_bytes);
                    inputs.push(ResolvedInput::File {
                        path: path.clone(),
                        digest: digest.digest,
                        size_bytes: digest.size_bytes,
                    });
                }
                Ok((inputs, size))
            }

            Instruction::RunCommand { command, cost } => Ok((
                vec![ResolvedInput::Command {
                    command: command.clone(),
                }],
                cost.unwrap_or(self.cost.run_command_bytes),
            )),

            Instruction::Metadata { labels } => Ok((
                labels
                    .iter()
                    .map(|(key, value)| ResolvedInput::Label {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                self.cost.metadata_bytes,
            )),
        }
    }

    fn emit(&self, stage: &str, step: &BuildStep, status: CacheStatus, fingerprint: &Fingerprint) {
        if let Some(ref observer) = self.observer {
            observer.on_step(StepEvent {
                stage: stage.to_string(),
                index: step.index,
                kind: step.kind(),
                status,
                fingerprint: fingerprint.clone(),
            });
        }
    }
}

fn cancelled(graph: &BuildGraph, index: usize) -> StepFailure {
    let err = StrataError::Cancelled {
        stage: graph.name.clone(),
        index,
    };
    let kind = graph.steps.get(index).map(BuildStep::kind);
    StepFailure::from_error(&graph.name, index, kind, &err)
}

fn assemble_image(stage: &StageReport) -> Option<Image> {
    let fingerprint = stage.final_fingerprint.clone()?;
    Some(Image {
        target: stage.name.clone(),
        fingerprint,
        layers: stage.steps.iter().map(|s| s.fingerprint.clone()).collect(),
        size_bytes: sum_bytes(stage.steps.iter().map(|s| s.size_bytes)),
    })
}
