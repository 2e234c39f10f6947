//! Pipeline declarations with static artifact contracts.
//!
//! A declaration is an ordered stage list where each entry carries the
//! artifacts it requires, the artifacts it produces, and its timeout pair.
//! Contracts are assembled once at configuration load: a stage's `requires`
//! is the set of artifacts it consumes that some earlier stage in the same
//! pipeline actually produces. This keeps the contract static per pipeline
//! while letting the same stage run with fewer inputs in shorter pipelines
//! (implement needs no spec in the trivial pipeline — nothing upstream
//! writes one).

use std::collections::BTreeSet;
use std::time::Duration;

use shipwright_utils::types::StageId;

use crate::Config;

/// One stage entry in a pipeline declaration.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    /// Artifact names that must exist before the stage runs.
    pub requires: Vec<String>,
    /// Artifact names the stage must have written when it passes.
    pub produces: Vec<String>,
    /// Idle timeout for agent invocations issued by this stage.
    pub idle_timeout: Duration,
    /// Hard timeout for agent invocations issued by this stage.
    pub hard_timeout: Duration,
}

/// An assembled, immutable pipeline: ordered stages plus contracts.
#[derive(Debug, Clone)]
pub struct PipelineDeclaration {
    pub label: String,
    pub stages: Vec<StageSpec>,
}

impl PipelineDeclaration {
    /// Assemble a declaration for `label` from an ordered stage list.
    #[must_use]
    pub fn assemble(label: &str, stages: &[StageId], config: &Config) -> Self {
        let mut available: BTreeSet<&'static str> = BTreeSet::new();
        let mut specs = Vec::with_capacity(stages.len());

        for &id in stages {
            let requires = consumes(id)
                .iter()
                .filter(|name| available.contains(*name))
                .map(|name| (*name).to_string())
                .collect();
            let produces: Vec<String> =
                emits(id).iter().map(|name| (*name).to_string()).collect();
            for name in emits(id) {
                available.insert(name);
            }

            let (idle_timeout, hard_timeout) = config.timeouts_for_stage(id);
            specs.push(StageSpec {
                id,
                requires,
                produces,
                idle_timeout,
                hard_timeout,
            });
        }

        Self {
            label: label.to_string(),
            stages: specs,
        }
    }

    /// Look up the entry for a stage, if it is part of this pipeline.
    #[must_use]
    pub fn stage(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Whether a stage appears in this pipeline.
    #[must_use]
    pub fn contains(&self, id: StageId) -> bool {
        self.stage(id).is_some()
    }

    /// Index of a stage within the declaration.
    #[must_use]
    pub fn position(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }
}

/// Artifacts a stage consumes when they are available.
const fn consumes(stage: StageId) -> &'static [&'static str] {
    match stage {
        StageId::Clarify => &[],
        StageId::Specify => &["decisions.json"],
        StageId::Decompose => &["spec.md"],
        StageId::Design => &["spec.md", "subtasks.json"],
        StageId::Implement => &["spec.md", "design.md"],
        StageId::Verify => &["notes.md"],
        StageId::Polish | StageId::Integrate | StageId::Deliver => &[],
    }
}

/// Artifacts a stage writes when it passes.
const fn emits(stage: StageId) -> &'static [&'static str] {
    match stage {
        StageId::Clarify => &["decisions.json"],
        StageId::Specify => &["spec.md"],
        StageId::Decompose => &["subtasks.json"],
        StageId::Design => &["design.md"],
        StageId::Implement => &["notes.md"],
        StageId::Verify => &["verify-report.json"],
        StageId::Polish | StageId::Integrate => &[],
        StageId::Deliver => &["delivery-report.md"],
    }
}
