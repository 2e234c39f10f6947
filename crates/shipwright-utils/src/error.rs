use thiserror::Error;

use crate::types::StageId;

/// Top-level error type aggregating every failure domain in the workspace.
///
/// Mirrors the crate split: configuration resolution, artifact storage, and
/// the pipeline engine each have their own enum, aggregated here via
/// `#[from]` so callers at the facade level can match on one type.
///
/// The process lifecycle manager deliberately has no error enum: every
/// invocation failure is encoded in the result's `status` field and never
/// raised.
#[derive(Error, Debug)]
pub enum ShipwrightError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while resolving the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    FileRead { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    FileParse { path: String, reason: String },

    #[error("Unknown stage name '{name}' in pipeline '{pipeline}'")]
    UnknownStage { name: String, pipeline: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Errors from the artifact store collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Artifact '{name}' not found for task {task_id}")]
    NotFound { task_id: String, name: String },

    #[error("Operation '{operation}' is not supported by this store")]
    Unsupported { operation: String },

    #[error("Invalid artifact name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unrecoverable failures raised by stage modules and the pipeline engine.
///
/// Raising one of these aborts the run for the task; the engine catches it
/// at the stage boundary, marks the task failed, and preserves all produced
/// artifacts and the worktree for manual resume.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Stage {stage} requires artifact '{name}' which does not exist")]
    MissingArtifact { stage: StageId, name: String },

    #[error("Stage {stage} passed without producing declared artifact '{name}'")]
    MissingProduct { stage: StageId, name: String },

    #[error("Stage {stage} agent invocation ended with status {status}: {detail}")]
    Invocation {
        stage: StageId,
        status: String,
        detail: String,
    },

    #[error("Rate limit backoff exhausted after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("Convergence call ended with status {status}: {detail}")]
    Converge { status: String, detail: String },

    #[error("Decompose produced an invalid subtask graph: {reason}")]
    Decompose { reason: String },

    #[error("Worktree merge could not be auto-resolved; manual runbook:\n{runbook}")]
    MergeConflict { runbook: String },

    #[error("No pipeline registered for label '{label}'")]
    UnknownPipeline { label: String },

    #[error("No stage implementation registered for '{stage}'")]
    UnregisteredStage { stage: StageId },

    #[error("Structured output extraction failed for stage {stage}: {source}")]
    BadStructuredOutput {
        stage: StageId,
        source: JsonExtractError,
    },

    #[error("Artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to locate any JSON value in a blob of model output.
///
/// Extraction is total over the expected shapes (fenced block, bare object,
/// bare array, embedded object); this error means none of them matched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no JSON value found in text ({preview})")]
pub struct JsonExtractError {
    /// Short head of the offending text, for diagnostics.
    pub preview: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display_names_stage() {
        let err = EngineError::MissingArtifact {
            stage: StageId::Implement,
            name: "spec.md".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("implement"));
        assert!(msg.contains("spec.md"));
    }

    #[test]
    fn test_store_error_converts_into_engine_error() {
        let store = StoreError::NotFound {
            task_id: "t-1".to_string(),
            name: "design.md".to_string(),
        };
        let engine: EngineError = store.into();
        assert!(matches!(engine, EngineError::Store(_)));
    }

    #[test]
    fn test_aggregate_conversions() {
        let cfg = ConfigError::InvalidValue {
            key: "token_budget".to_string(),
            reason: "negative".to_string(),
        };
        let top: ShipwrightError = cfg.into();
        assert!(matches!(top, ShipwrightError::Config(_)));
    }
}
