use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shipwright_utils::types::{OutputMode, Provider, TokenUsage};

/// Timer budget for one invocation. Any subset of the three timers may be
/// armed; the first to fire kills the process tree and stamps its kind on
/// the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Absolute wall-clock limit used when a call has exactly one budget.
    pub single: Option<Duration>,
    /// Inactivity limit, reset on any stdout activity.
    pub idle: Option<Duration>,
    /// Absolute wall-clock ceiling regardless of activity.
    pub hard: Option<Duration>,
}

impl Timeouts {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            single: None,
            idle: None,
            hard: None,
        }
    }

    /// Idle + hard pair, the shape stages use.
    #[must_use]
    pub const fn idle_hard(idle: Duration, hard: Duration) -> Self {
        Self {
            single: None,
            idle: Some(idle),
            hard: Some(hard),
        }
    }

    /// One absolute budget.
    #[must_use]
    pub const fn single(limit: Duration) -> Self {
        Self {
            single: Some(limit),
            idle: None,
            hard: None,
        }
    }
}

/// Append-only transcript destinations for the logging variant. Both are
/// optional; an invocation with neither set writes no transcript.
#[derive(Debug, Clone, Default)]
pub struct LogTargets {
    /// Per-task transcript, shared by every stage of the task.
    pub task_log: Option<PathBuf>,
    /// Per-stage transcript.
    pub stage_log: Option<PathBuf>,
}

impl LogTargets {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.task_log.is_none() && self.stage_log.is_none()
    }
}

/// One immutable agent invocation request.
///
/// Built with the `with_*` combinators; the lifecycle manager never mutates
/// a request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub provider: Provider,
    pub model: String,
    pub working_dir: Option<PathBuf>,
    pub output_mode: OutputMode,
    pub tool_allow_list: Vec<String>,
    pub timeouts: Timeouts,
    pub log_targets: LogTargets,
}

impl AgentRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            provider: Provider::default(),
            model: "sonnet".to_string(),
            working_dir: None,
            output_mode: OutputMode::default(),
            tool_allow_list: Vec::new(),
            timeouts: Timeouts::none(),
            log_targets: LogTargets::default(),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    #[must_use]
    pub fn with_tool_allow_list(mut self, tools: Vec<String>) -> Self {
        self.tool_allow_list = tools;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_log_targets(mut self, targets: LogTargets) -> Self {
        self.log_targets = targets;
        self
    }
}

/// Terminal status of one invocation. Exactly one holds; downstream code
/// dispatches solely on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Process exited 0.
    Done,
    /// A timer fired and the process tree was killed.
    Timeout,
    /// Non-zero exit whose stderr matched the rate-limit pattern.
    RateLimited,
    /// Non-zero exit, signal death, or spawn failure.
    Failed,
}

impl AgentStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Failed => "failed",
        }
    }
}

/// Which timer killed a timed-out invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutKind {
    Single,
    Idle,
    Hard,
}

impl TimeoutKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Idle => "idle",
            Self::Hard => "hard",
        }
    }
}

/// Normalized outcome of one invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub status: AgentStatus,
    /// Raw captured stdout (the event stream in stream-json mode).
    pub stdout: String,
    /// Raw captured stderr.
    pub stderr: String,
    /// Exit code when the process exited normally.
    pub exit_code: Option<i32>,
    /// Set iff `status == Timeout`.
    pub timeout_kind: Option<TimeoutKind>,
    /// Authoritative final text: the result event's text when one arrived,
    /// else the accumulated assistant text (or raw stdout in text mode).
    pub final_text: String,
    pub token_usage: TokenUsage,
    pub duration: Duration,
}

impl AgentResult {
    /// Result for a failure before or at spawn; encodes the reason in
    /// stderr so callers see a uniform shape.
    #[must_use]
    pub fn spawn_failure(reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: AgentStatus::Failed,
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: None,
            timeout_kind: None,
            final_text: String::new(),
            token_usage: TokenUsage::default(),
            duration,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self.status, AgentStatus::Done)
    }

    /// The text downstream stages consume: final text when present, else
    /// the raw stdout.
    #[must_use]
    pub fn text(&self) -> &str {
        if self.final_text.is_empty() {
            &self.stdout
        } else {
            &self.final_text
        }
    }
}

/// Seam between the engine and the process lifecycle manager.
///
/// Production uses [`crate::CliAgent`]; tests substitute scripted mocks.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Run one agent invocation to completion. Never raises: every failure
    /// is encoded in the result's `status`.
    async fn invoke(&self, request: &AgentRequest) -> AgentResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_defaults() {
        let req = AgentRequest::new("do the thing");
        assert_eq!(req.provider, Provider::Claude);
        assert_eq!(req.output_mode, OutputMode::StreamJson);
        assert!(req.timeouts.single.is_none());
        assert!(req.log_targets.is_empty());
    }

    #[test]
    fn test_request_builder_combinators() {
        let req = AgentRequest::new("p")
            .with_provider(Provider::Codex)
            .with_model("opus")
            .with_working_dir("/tmp/task")
            .with_output_mode(OutputMode::Text)
            .with_tool_allow_list(vec!["Read".to_string()])
            .with_timeouts(Timeouts::single(Duration::from_secs(60)));
        assert_eq!(req.provider, Provider::Codex);
        assert_eq!(req.model, "opus");
        assert_eq!(req.output_mode, OutputMode::Text);
        assert_eq!(req.timeouts.single, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_result_text_prefers_final_text() {
        let mut result = AgentResult::spawn_failure("boom", Duration::ZERO);
        result.stdout = "raw".to_string();
        assert_eq!(result.text(), "raw");
        result.final_text = "authoritative".to_string();
        assert_eq!(result.text(), "authoritative");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(AgentStatus::RateLimited.as_str(), "rate_limited");
        assert_eq!(TimeoutKind::Idle.as_str(), "idle");
    }
}
