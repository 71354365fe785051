//! Stages and build plans
//!
//! A stage is a totally ordered list of steps. A plan is the ordered list
//! of stages in one build; `copy-files --from` edges may only point at
//! stages defined earlier, so the stage graph is acyclic by construction.

use crate::build::fingerprint::Fingerprint;
use crate::build::step::{BuildStep, Instruction};
use crate::error::{StrataError, StrataResult};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One stage: an ordered sequence of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildGraph {
    /// Unique stage name
    pub name: String,
    /// Steps in execution order
    pub steps: Vec<BuildStep>,
}

impl BuildGraph {
    /// Create a stage, numbering the instructions in order
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        let steps = instructions
            .into_iter()
            .enumerate()
            .map(|(index, instruction)| BuildStep { index, instruction })
            .collect();
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Names of stages this stage copies from (deduplicated, in order)
    pub fn stage_references(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .filter_map(|s| s.instruction.stage_reference())
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// All stages of one build plus the stage that forms the output image
#[derive(Debug, Clone)]
pub struct BuildPlan {
    stages: Vec<BuildGraph>,
    target: String,
}

impl BuildPlan {
    /// Validate stages and pick the target (last stage by default).
    ///
    /// Stage references are checked at build time so that a bad reference
    /// fails only the stage that makes it.
    pub fn new(stages: Vec<BuildGraph>, target: Option<String>) -> StrataResult<Self> {
        Self::validated(stages, target, Path::new("<plan>"))
    }

    pub(crate) fn validated(
        stages: Vec<BuildGraph>,
        target: Option<String>,
        origin: &Path,
    ) -> StrataResult<Self> {
        if stages.is_empty() {
            return Err(StrataError::buildfile(origin, "no stages defined"));
        }

        let mut names = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(StrataError::buildfile(origin, "stage name cannot be empty"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(StrataError::buildfile(
                    origin,
                    format!("duplicate stage name '{}'", stage.name),
                ));
            }
            if stage.steps.is_empty() {
                return Err(StrataError::buildfile(
                    origin,
                    format!("stage '{}' has no steps", stage.name),
                ));
            }
        }

        let target = match target {
            Some(t) if names.contains(t.as_str()) => t,
            Some(t) => {
                return Err(StrataError::buildfile(
                    origin,
                    format!("target stage '{}' is not defined", t),
                ))
            }
            None => stages[stages.len() - 1].name.clone(),
        };

        Ok(Self { stages, target })
    }

    /// Stages in definition order
    pub fn stages(&self) -> &[BuildGraph] {
        &self.stages
    }

    /// Name of the stage that forms the output image
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&BuildGraph> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Total number of steps across all stages
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Group stage positions into waves that can run concurrently.
    ///
    /// A stage lands one wave after the latest stage it copies from.
    /// References to unknown or later stages are ignored here; they fail
    /// when the stage resolves its inputs.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let positions = self.positions();
        let mut level = vec![0usize; self.stages.len()];

        for (i, stage) in self.stages.iter().enumerate() {
            let wave = stage
                .stage_references()
                .into_iter()
                .filter_map(|r| positions.get(r).copied())
                .filter(|&p| p < i)
                .map(|p| level[p] + 1)
                .max()
                .unwrap_or(0);
            level[i] = wave;
        }

        let depth = level.iter().copied().max().unwrap_or(0);
        let mut waves = vec![Vec::new(); depth + 1];
        for (i, l) in level.into_iter().enumerate() {
            waves[l].push(i);
        }
        waves
    }

    /// Names of the target stage and every stage it transitively copies from
    pub fn required_stages(&self) -> HashSet<String> {
        let mut required = HashSet::new();
        let mut pending = vec![self.target.clone()];

        while let Some(name) = pending.pop() {
            if !required.insert(name.clone()) {
                continue;
            }
            if let Some(stage) = self.stage(&name) {
                pending.extend(stage.stage_references().into_iter().map(String::from));
            }
        }
        required
    }

    /// Stage name to definition position
    pub(crate) fn positions(&self) -> HashMap<&str, usize> {
        self.stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect()
    }
}

/// What a stage may see of the other stages while it resolves inputs
#[derive(Debug, Clone)]
pub struct StageScope {
    position: usize,
    declared: HashMap<String, usize>,
    completed: HashMap<String, Fingerprint>,
}

impl StageScope {
    /// Scope for the stage at `position`, given the final fingerprints of
    /// stages that completed so far
    pub fn new(
        plan: &BuildPlan,
        position: usize,
        completed: &HashMap<String, Fingerprint>,
    ) -> Self {
        let declared: HashMap<String, usize> = plan
            .positions()
            .into_iter()
            .map(|(name, i)| (name.to_string(), i))
            .collect();

        // Only stages defined earlier are visible
        let completed = completed
            .iter()
            .filter(|(name, _)| declared.get(*name).is_some_and(|&i| i < position))
            .map(|(name, fp)| (name.clone(), fp.clone()))
            .collect();

        Self {
            position,
            declared,
            completed,
        }
    }

    /// Scope for a stage built on its own, outside any plan
    pub fn standalone(completed: HashMap<String, Fingerprint>) -> Self {
        Self {
            position: usize::MAX,
            declared: HashMap::new(),
            completed,
        }
    }

    /// Resolve a `--from` reference to the stage's final fingerprint
    pub fn resolve(&self, name: &str) -> Result<&Fingerprint, String> {
        if let Some(fp) = self.completed.get(name) {
            return Ok(fp);
        }
        match self.declared.get(name) {
            Some(&i) if i == self.position => {
                Err(format!("stage '{}' cannot copy from itself", name))
            }
            Some(&i) if i > self.position => {
                Err(format!("forward reference to stage '{}'", name))
            }
            Some(_) => Err(format!("stage '{}' did not complete", name)),
            None => Err(format!("stage '{}' was never built", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::fingerprint::{compute, ResolvedInput};
    use crate::build::step::StepKind;

    fn base(image: &str) -> Instruction {
        Instruction::BaseImage {
            image: image.into(),
        }
    }

    fn copy_from(stage: &str) -> Instruction {
        Instruction::CopyFiles {
            files: vec!["/out".into()],
            from: Some(stage.into()),
            cost: None,
        }
    }

    fn some_fp(tag: &str) -> Fingerprint {
        compute(
            StepKind::BaseImage,
            &[ResolvedInput::Image { tag: tag.into() }],
            None,
        )
    }

    #[test]
    fn steps_are_numbered() {
        let graph = BuildGraph::new("app", vec![base("x"), copy_from("b")]);
        assert_eq!(graph.steps[0].index, 0);
        assert_eq!(graph.steps[1].index, 1);
    }

    #[test]
    fn target_defaults_to_last_stage() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("builder", vec![base("x")]),
                BuildGraph::new("app", vec![base("y")]),
            ],
            None,
        )
        .unwrap();
        assert_eq!(plan.target(), "app");
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = BuildPlan::new(
            vec![
                BuildGraph::new("a", vec![base("x")]),
                BuildGraph::new("a", vec![base("y")]),
            ],
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn rejects_empty_stage_and_unknown_target() {
        assert!(BuildPlan::new(vec![BuildGraph::new("a", vec![])], None).is_err());
        assert!(BuildPlan::new(
            vec![BuildGraph::new("a", vec![base("x")])],
            Some("b".into())
        )
        .is_err());
        assert!(BuildPlan::new(vec![], None).is_err());
    }

    #[test]
    fn independent_stages_share_a_wave() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("frontend", vec![base("node:18-alpine")]),
                BuildGraph::new("backend", vec![base("node:18-alpine")]),
                BuildGraph::new(
                    "app",
                    vec![base("alpine"), copy_from("frontend"), copy_from("backend")],
                ),
            ],
            None,
        )
        .unwrap();

        assert_eq!(plan.waves(), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn chained_stages_get_later_waves() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("a", vec![base("x")]),
                BuildGraph::new("b", vec![base("x"), copy_from("a")]),
                BuildGraph::new("c", vec![base("x"), copy_from("b")]),
                BuildGraph::new("d", vec![base("x")]),
            ],
            None,
        )
        .unwrap();

        assert_eq!(plan.waves(), vec![vec![0, 3], vec![1], vec![2]]);
    }

    #[test]
    fn forward_references_do_not_affect_waves() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("a", vec![base("x"), copy_from("b")]),
                BuildGraph::new("b", vec![base("x")]),
            ],
            None,
        )
        .unwrap();
        assert_eq!(plan.waves(), vec![vec![0, 1]]);
    }

    #[test]
    fn required_stages_follow_references() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("builder", vec![base("x")]),
                BuildGraph::new("unused", vec![base("y")]),
                BuildGraph::new("app", vec![base("z"), copy_from("builder")]),
            ],
            None,
        )
        .unwrap();

        let required = plan.required_stages();
        assert!(required.contains("app"));
        assert!(required.contains("builder"));
        assert!(!required.contains("unused"));
    }

    #[test]
    fn scope_hides_later_stages() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("a", vec![base("x"), copy_from("b")]),
                BuildGraph::new("b", vec![base("x")]),
            ],
            None,
        )
        .unwrap();

        let mut completed = HashMap::new();
        completed.insert("b".to_string(), some_fp("b"));

        let scope = StageScope::new(&plan, 0, &completed);
        let err = scope.resolve("b").unwrap_err();
        assert!(err.contains("forward reference"));
        assert!(scope.resolve("nope").unwrap_err().contains("never built"));
        assert!(scope.resolve("a").unwrap_err().contains("itself"));
    }

    #[test]
    fn scope_reports_incomplete_stage() {
        let plan = BuildPlan::new(
            vec![
                BuildGraph::new("a", vec![base("x")]),
                BuildGraph::new("b", vec![base("x"), copy_from("a")]),
            ],
            None,
        )
        .unwrap();

        let scope = StageScope::new(&plan, 1, &HashMap::new());
        assert!(scope.resolve("a").unwrap_err().contains("did not complete"));

        let mut completed = HashMap::new();
        completed.insert("a".to_string(), some_fp("a"));
        let scope = StageScope::new(&plan, 1, &completed);
        assert_eq!(scope.resolve("a").unwrap(), &some_fp("a"));
    }
}
