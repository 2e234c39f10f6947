//! The `Stage` capability and the per-task mutable state it runs against.
//!
//! Every stage returns the same [`StageResult`] shape, letting the
//! pipeline engine treat all nine stages polymorphically. The only shared
//! mutable structure per task is [`TaskState`], passed by `&mut` — stages
//! never run concurrently for the same task, so no synchronization is
//! needed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shipwright_agent::{AgentBackend, AgentRequest, AgentResult, LogTargets, Timeouts};
use shipwright_config::{Config, StageSpec};
use shipwright_utils::error::{EngineError, StoreError};
use shipwright_utils::types::{StageId, TokenUsage};

use crate::ports::{ArtifactStore, KnowledgeStore};

/// Status of one stage execution. Exactly one holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Advance to the next stage.
    Pass,
    /// Halt and surface feedback.
    Fail,
    /// Advance without side effects.
    Skip,
}

impl StageStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

/// Uniform result returned by every stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub status: StageStatus,
    /// Short human-readable account of what the stage did.
    pub output: String,
    /// Consolidated feedback, set on gate failure.
    pub feedback: Option<String>,
    /// Tokens spent by this stage's own invocations.
    pub usage: TokenUsage,
    /// Structured report for machine consumers.
    pub report: Option<Value>,
}

impl StageResult {
    #[must_use]
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Pass,
            output: output.into(),
            feedback: None,
            usage: TokenUsage::default(),
            report: None,
        }
    }

    #[must_use]
    pub fn fail(output: impl Into<String>, feedback: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            output: output.into(),
            feedback: Some(feedback.into()),
            usage: TokenUsage::default(),
            report: None,
        }
    }

    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skip,
            output: reason.into(),
            feedback: None,
            usage: TokenUsage::default(),
            report: None,
        }
    }

    #[must_use]
    pub fn with_report(mut self, report: Value) -> Self {
        self.report = Some(report);
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// One node of the decompose DAG. The id namespaces per-subtask artifact
/// filenames (`design-<id>.md`, `notes-<id>.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub estimated_files: Vec<String>,
}

/// Immutable description of the task handed to the engine.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    /// Size/complexity label selecting one of the named pipelines.
    pub label: String,
    /// Root worktree the agent operates in.
    pub working_dir: Option<PathBuf>,
}

impl TaskSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            label: label.into(),
            working_dir: None,
        }
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Shared per-task mutable state: the subtask DAG, accumulated warnings,
/// and token counters. Owned by the pipeline engine, mutated in place by
/// stages.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task: TaskSpec,
    pub subtasks: Vec<Subtask>,
    /// Topological scheduling hints computed by decompose.
    pub waves: Vec<Vec<String>>,
    /// Set when decompose returned an empty list and the task fell back to
    /// single-task execution.
    pub decompose_skipped: bool,
    pub warnings: Vec<String>,
    pub usage: TokenUsage,
}

impl TaskState {
    #[must_use]
    pub fn new(task: TaskSpec) -> Self {
        Self {
            task,
            subtasks: Vec::new(),
            waves: Vec::new(),
            decompose_skipped: false,
            warnings: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Fraction of the global token budget spent so far; 0.0 when the
    /// budget is unlimited.
    #[must_use]
    pub fn budget_fraction(&self, token_budget: u64) -> f64 {
        if token_budget == 0 {
            return 0.0;
        }
        self.usage.total() as f64 / token_budget as f64
    }
}

/// Everything a stage sees while running: the task state it may mutate,
/// the collaborators, the agent seam, and its own pipeline entry.
pub struct StageContext<'a> {
    pub state: &'a mut TaskState,
    pub store: Arc<dyn ArtifactStore>,
    pub knowledge: Option<Arc<dyn KnowledgeStore>>,
    pub agent: Arc<dyn AgentBackend>,
    pub config: Arc<Config>,
    pub spec: &'a StageSpec,
}

impl StageContext<'_> {
    /// Build an agent request for this stage: model and timeout pair from
    /// the stage's pipeline entry, working directory from the task, and
    /// transcript targets under the configured log directory.
    #[must_use]
    pub fn request(&self, prompt: String) -> AgentRequest {
        let stage = self.spec.id;
        let mut request = AgentRequest::new(prompt)
            .with_provider(self.config.provider)
            .with_model(self.config.model_for_stage(stage))
            .with_tool_allow_list(self.config.tool_allow_list.clone())
            .with_timeouts(Timeouts::idle_hard(
                self.spec.idle_timeout,
                self.spec.hard_timeout,
            ));
        if let Some(dir) = &self.state.task.working_dir {
            request = request.with_working_dir(dir);
        }
        if let Some(log_dir) = &self.config.log_dir {
            let task_dir = log_dir.join(&self.state.task.id);
            request = request.with_log_targets(LogTargets {
                task_log: Some(task_dir.join("task.log")),
                stage_log: Some(task_dir.join(format!("{}.log", stage.as_str()))),
            });
        }
        request
    }

    /// Invoke the agent and absorb its token usage into the task state.
    pub async fn invoke(&mut self, request: &AgentRequest) -> AgentResult {
        let result = self.agent.invoke(request).await;
        self.state.usage.absorb(result.token_usage);
        result
    }

    /// Invoke and require a `done` outcome; any other status aborts the
    /// stage with a typed error.
    ///
    /// # Errors
    ///
    /// [`EngineError::Invocation`] for timeout, rate-limited, and failed
    /// outcomes — stage-level failures are not silently retried.
    pub async fn invoke_done(&mut self, prompt: String) -> Result<String, EngineError> {
        let request = self.request(prompt);
        let result = self.invoke(&request).await;
        if result.is_done() {
            return Ok(result.text().to_string());
        }
        Err(EngineError::Invocation {
            stage: self.spec.id,
            status: result.status.as_str().to_string(),
            detail: summarize_failure(&result),
        })
    }

    /// Load a required artifact for this task.
    pub async fn load(&self, name: &str) -> Result<String, EngineError> {
        Ok(self.store.load_artifact(&self.state.task.id, name).await?)
    }

    /// Load an artifact that may legitimately be absent.
    pub async fn load_optional(&self, name: &str) -> Result<Option<String>, EngineError> {
        match self.store.load_artifact(&self.state.task.id, name).await {
            Ok(content) => Ok(Some(content)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Save an artifact for this task.
    pub async fn save(&self, name: &str, content: &str) -> Result<(), EngineError> {
        Ok(self
            .store
            .save_artifact(&self.state.task.id, name, content)
            .await?)
    }

    /// Query the knowledge store, swallowing unreachability as "no extra
    /// context".
    pub async fn knowledge_context(&self, query: &str, limit: usize) -> String {
        let Some(knowledge) = &self.knowledge else {
            return String::new();
        };
        match knowledge.search(query, limit).await {
            Ok(entries) if !entries.is_empty() => {
                let mut context = String::from("# Prior knowledge\n\n");
                for entry in entries {
                    context.push_str(&format!("## {}\n\n{}\n\n", entry.title, entry.body));
                }
                context
            }
            Ok(_) => String::new(),
            Err(e) => {
                tracing::debug!(error = %e, "knowledge store unreachable; continuing without context");
                String::new()
            }
        }
    }
}

fn summarize_failure(result: &AgentResult) -> String {
    let stderr_tail: String = result
        .stderr
        .chars()
        .rev()
        .take(300)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    match result.timeout_kind {
        Some(kind) => format!("{} timeout after {:?}", kind.as_str(), result.duration),
        None => format!(
            "exit code {:?}, stderr: {}",
            result.exit_code,
            stderr_tail.trim()
        ),
    }
}

/// Core capability every pipeline unit implements.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage's identifier, matching its pipeline entries.
    fn id(&self) -> StageId;

    /// Execute the stage against the task.
    ///
    /// # Errors
    ///
    /// [`EngineError`] on unrecoverable conditions; the engine catches
    /// this at the stage boundary and marks the task failed, preserving
    /// all produced artifacts.
    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_is_exactly_one_of_three() {
        for (status, name) in [
            (StageStatus::Pass, "pass"),
            (StageStatus::Fail, "fail"),
            (StageStatus::Skip, "skip"),
        ] {
            assert_eq!(status.as_str(), name);
        }
    }

    #[test]
    fn test_result_constructors() {
        let pass = StageResult::pass("wrote spec.md");
        assert_eq!(pass.status, StageStatus::Pass);
        assert!(pass.feedback.is_none());

        let fail = StageResult::fail("gate failed", "2 critical issues");
        assert_eq!(fail.status, StageStatus::Fail);
        assert_eq!(fail.feedback.as_deref(), Some("2 critical issues"));

        let skip = StageResult::skip("not part of this pipeline");
        assert_eq!(skip.status, StageStatus::Skip);
    }

    #[test]
    fn test_budget_fraction() {
        let mut state = TaskState::new(TaskSpec::new("t", "d", "medium"));
        state.usage.absorb(TokenUsage::new(500, 450));
        assert!((state.budget_fraction(1000) - 0.95).abs() < f64::EPSILON);
        assert_eq!(state.budget_fraction(0), 0.0);
    }

    #[test]
    fn test_subtask_deserializes_with_defaults() {
        let sub: Subtask =
            serde_json::from_str(r#"{"id": "s1", "title": "wire the parser"}"#).unwrap();
        assert_eq!(sub.id, "s1");
        assert!(sub.blocked_by.is_empty());
        assert!(sub.estimated_files.is_empty());
    }
}
