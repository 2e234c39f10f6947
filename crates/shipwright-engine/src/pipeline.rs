//! The pipeline/gate engine: `pending → stage₁ → … → stageₙ →
//! done|failed|review`.
//!
//! The engine owns stage sequencing and the shared per-task state. Each
//! stage's `requires` contract is checked before it runs and its
//! `produces` contract after; a stage raising aborts the run with all
//! produced artifacts preserved. A verify-gate failure rewinds once to
//! implement with the consolidated feedback before halting in `review`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use shipwright_agent::AgentBackend;
use shipwright_config::Config;
use shipwright_utils::error::EngineError;
use shipwright_utils::logging::{log_stage_complete, stage_span};
use shipwright_utils::types::{StageId, TokenUsage};

use crate::ports::{ArtifactStore, KnowledgeStore};
use crate::stage::{Stage, StageContext, StageResult, StageStatus, TaskSpec, TaskState};
use crate::stages::default_registry;

/// Verify-gate failures rewind to implement at most this many times per
/// run.
const VERIFY_REWIND_LIMIT: u32 = 1;

/// Terminal status of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Every stage passed or skipped.
    Done,
    /// A stage raised, a contract was violated, or the pipeline is
    /// unknown.
    Failed,
    /// A gate failed with feedback; human attention required.
    Review,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Review => "review",
        }
    }
}

/// One recorded stage execution (or skip).
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: StageId,
    pub result: StageResult,
}

/// Full account of one task run.
#[derive(Debug)]
pub struct TaskRun {
    pub task_id: String,
    pub label: String,
    pub status: TaskStatus,
    /// Stage results in execution order (a rewound stage appears once per
    /// attempt), followed by skip records for stages outside the
    /// pipeline.
    pub outcomes: Vec<StageOutcome>,
    pub error: Option<String>,
    pub state: TaskState,
}

impl TaskRun {
    /// The last recorded outcome for a stage.
    #[must_use]
    pub fn outcome_for(&self, stage: StageId) -> Option<&StageOutcome> {
        self.outcomes.iter().rev().find(|o| o.stage == stage)
    }

    /// The surfaced feedback when the run halted on a gate failure.
    #[must_use]
    pub fn feedback(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .rev()
            .find(|o| o.result.status == StageStatus::Fail)
            .and_then(|o| o.result.feedback.as_deref())
    }
}

/// Assembles stages into the named pipelines and runs tasks through them.
pub struct PipelineEngine {
    agent: Arc<dyn AgentBackend>,
    store: Arc<dyn ArtifactStore>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    config: Arc<Config>,
    registry: HashMap<StageId, Box<dyn Stage>>,
}

impl PipelineEngine {
    /// Build an engine with the default stage registry, resolved once.
    #[must_use]
    pub fn new(
        agent: Arc<dyn AgentBackend>,
        store: Arc<dyn ArtifactStore>,
        knowledge: Option<Arc<dyn KnowledgeStore>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            agent,
            store,
            knowledge,
            config,
            registry: default_registry(),
        }
    }

    /// Replace one stage implementation. Test seam; not part of the
    /// stable API.
    #[doc(hidden)]
    pub fn register_stage(&mut self, stage: Box<dyn Stage>) {
        self.registry.insert(stage.id(), stage);
    }

    /// Run one task through the pipeline its label selects.
    pub async fn run_task(&self, task: TaskSpec) -> TaskRun {
        let mut state = TaskState::new(task);
        let task_id = state.task.id.clone();
        let label = state.task.label.clone();

        let Some(declaration) = self.config.pipeline_for_label(&label) else {
            let err = EngineError::UnknownPipeline {
                label: label.clone(),
            };
            error!(task_id = %task_id, %err, "cannot run task");
            return TaskRun {
                task_id,
                label,
                status: TaskStatus::Failed,
                outcomes: Vec::new(),
                error: Some(err.to_string()),
                state,
            };
        };

        let mut outcomes: Vec<StageOutcome> = Vec::new();
        let mut status = TaskStatus::Done;
        let mut run_error: Option<String> = None;
        let mut verify_rewinds = 0u32;
        let mut index = 0usize;

        'stages: while index < declaration.stages.len() {
            let spec = &declaration.stages[index];
            let stage_id = spec.id;
            stage_span(&task_id, stage_id.as_str()).in_scope(|| info!("starting stage"));

            // requires contract: a stage with an unmet artifact never runs.
            for name in &spec.requires {
                match self.store.has_artifact(&task_id, name).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let err = EngineError::MissingArtifact {
                            stage: stage_id,
                            name: name.clone(),
                        };
                        error!(%err, "artifact contract violated");
                        status = TaskStatus::Failed;
                        run_error = Some(err.to_string());
                        break 'stages;
                    }
                    Err(e) => {
                        status = TaskStatus::Failed;
                        run_error = Some(e.to_string());
                        break 'stages;
                    }
                }
            }

            let Some(stage) = self.registry.get(&stage_id) else {
                let err = EngineError::UnregisteredStage { stage: stage_id };
                status = TaskStatus::Failed;
                run_error = Some(err.to_string());
                break 'stages;
            };

            let usage_before = state.usage;
            let started = Instant::now();
            let mut ctx = StageContext {
                state: &mut state,
                store: Arc::clone(&self.store),
                knowledge: self.knowledge.clone(),
                agent: Arc::clone(&self.agent),
                config: Arc::clone(&self.config),
                spec,
            };

            match stage.run(&mut ctx).await {
                Err(e) => {
                    // Stage raised: mark the task failed, keep every
                    // artifact and the worktree for manual resume.
                    error!(stage = %stage_id, error = %e, "stage raised; task failed");
                    status = TaskStatus::Failed;
                    run_error = Some(e.to_string());
                    break 'stages;
                }
                Ok(mut result) => {
                    result.usage = usage_delta(usage_before, state.usage);
                    log_stage_complete(
                        &task_id,
                        stage_id.as_str(),
                        result.status.as_str(),
                        started.elapsed().as_millis(),
                    );

                    match result.status {
                        StageStatus::Pass => {
                            for name in &spec.produces {
                                match self.store.has_artifact(&task_id, name).await {
                                    Ok(true) => {}
                                    _ => {
                                        let err = EngineError::MissingProduct {
                                            stage: stage_id,
                                            name: name.clone(),
                                        };
                                        error!(%err, "artifact contract violated");
                                        outcomes.push(StageOutcome {
                                            stage: stage_id,
                                            result,
                                        });
                                        status = TaskStatus::Failed;
                                        run_error = Some(err.to_string());
                                        break 'stages;
                                    }
                                }
                            }
                            outcomes.push(StageOutcome {
                                stage: stage_id,
                                result,
                            });
                            index += 1;
                        }
                        StageStatus::Skip => {
                            outcomes.push(StageOutcome {
                                stage: stage_id,
                                result,
                            });
                            index += 1;
                        }
                        StageStatus::Fail => {
                            let rewind_target = declaration
                                .position(StageId::Implement)
                                .filter(|p| *p < index);
                            outcomes.push(StageOutcome {
                                stage: stage_id,
                                result,
                            });
                            match rewind_target {
                                Some(target)
                                    if stage_id == StageId::Verify
                                        && verify_rewinds < VERIFY_REWIND_LIMIT =>
                                {
                                    verify_rewinds += 1;
                                    warn!(
                                        stage = %stage_id,
                                        "gate failed; rewinding to implement with feedback"
                                    );
                                    index = target;
                                }
                                _ => {
                                    info!(stage = %stage_id, "gate failed; task needs review");
                                    status = TaskStatus::Review;
                                    break 'stages;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Stages outside the selected pipeline are recorded as skipped, so
        // a run report always covers all nine stages.
        for stage_id in StageId::ALL {
            if !declaration.contains(stage_id) {
                outcomes.push(StageOutcome {
                    stage: stage_id,
                    result: StageResult::skip(format!(
                        "not part of the '{label}' pipeline"
                    )),
                });
            }
        }

        TaskRun {
            task_id,
            label,
            status,
            outcomes,
            error: run_error,
            state,
        }
    }
}

fn usage_delta(before: TokenUsage, after: TokenUsage) -> TokenUsage {
    TokenUsage::new(
        after.input.saturating_sub(before.input),
        after.output.saturating_sub(before.output),
    )
}
