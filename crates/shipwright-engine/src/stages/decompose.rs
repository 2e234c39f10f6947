//! Decompose: ask the model for an explicit subtask DAG and compute its
//! execution waves.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use shipwright_utils::error::EngineError;
use shipwright_utils::json::extract_json_as;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult, Subtask};
use crate::waves::compute_waves;

#[derive(Debug, Deserialize)]
struct DecomposeReport {
    #[serde(default)]
    subtasks: Vec<Subtask>,
}

#[derive(Debug, Clone)]
pub struct DecomposeStage;

impl DecomposeStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for DecomposeStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for DecomposeStage {
    fn id(&self) -> StageId {
        StageId::Decompose
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let spec = ctx.load("spec.md").await?;
        let prompt = format!(
            "Split the task below into independent subtasks that can be implemented in \
             isolated worktrees. Reply with JSON only, shaped:\n\
             {{\"subtasks\": [{{\"id\": \"s1\", \"title\": \"...\", \"description\": \"...\", \
             \"blocked_by\": [\"...\"], \"estimated_files\": [\"...\"]}}]}}\n\
             Ids must be unique; blocked_by may only reference other subtask ids. Return \
             an empty subtasks array if the task is too small to split usefully.\n\n\
             # Task\n\n{}\n\n# Specification\n\n{spec}",
            ctx.state.task.description,
        );
        let text = ctx.invoke_done(prompt).await?;

        let report: DecomposeReport =
            extract_json_as(&text).map_err(|source| EngineError::BadStructuredOutput {
                stage: StageId::Decompose,
                source,
            })?;

        if report.subtasks.is_empty() {
            // Too small to split: fall back to single-task execution
            // instead of erroring.
            ctx.state.decompose_skipped = true;
            ctx.save("subtasks.json", "[]").await?;
            return Ok(StageResult::pass(
                "no useful split found; falling back to single-task execution",
            )
            .with_report(json!({ "skipped": true, "subtasks": 0 })));
        }

        let waves = compute_waves(&report.subtasks)?;
        let serialized = serde_json::to_string_pretty(&report.subtasks)
            .map_err(|e| EngineError::Decompose {
                reason: format!("failed to serialize subtasks: {e}"),
            })?;
        ctx.save("subtasks.json", &serialized).await?;

        let report_json = json!({
            "skipped": false,
            "subtasks": report.subtasks.len(),
            "waves": waves,
        });
        ctx.state.subtasks = report.subtasks;
        ctx.state.waves = waves;

        Ok(StageResult::pass(format!(
            "split into {} subtasks across {} waves",
            ctx.state.subtasks.len(),
            ctx.state.waves.len(),
        ))
        .with_report(report_json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageStatus, TaskSpec, TaskState};
    use crate::testing::{MemoryArtifactStore, ScriptedBackend};
    use shipwright_config::Config;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn run_decompose(
        backend: ScriptedBackend,
    ) -> (Result<StageResult, EngineError>, Arc<MemoryArtifactStore>, TaskState) {
        let config = Arc::new(Config::load_from(None, &HashMap::new()).unwrap());
        let decl = config.pipeline_for_label("large").unwrap().clone();
        let spec = decl.stage(StageId::Decompose).unwrap();
        let store = Arc::new(MemoryArtifactStore::new());
        store.seed("t-1", "spec.md", "# Specification");
        let mut state = TaskState::new(TaskSpec::new("t-1", "build the importer", "large"));
        let mut ctx = StageContext {
            state: &mut state,
            store: store.clone(),
            knowledge: None,
            agent: Arc::new(backend),
            config,
            spec,
        };
        let result = DecomposeStage::new().run(&mut ctx).await;
        (result, store, state)
    }

    #[tokio::test]
    async fn test_dag_parsed_and_waves_computed() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result(
            r#"{"subtasks": [
                {"id": "s1", "title": "schema", "description": "d"},
                {"id": "s2", "title": "reader", "description": "d", "blocked_by": ["s1"]},
                {"id": "s3", "title": "writer", "description": "d", "blocked_by": ["s1"]}
            ]}"#,
        ));
        let (result, store, state) = run_decompose(backend).await;
        let result = result.unwrap();

        assert_eq!(result.status, StageStatus::Pass);
        assert_eq!(state.subtasks.len(), 3);
        assert_eq!(state.waves, vec![vec!["s1"], vec!["s2", "s3"]]);
        assert!(!state.decompose_skipped);
        assert!(store.content("t-1", "subtasks.json").unwrap().contains("reader"));
        let report = result.report.unwrap();
        assert_eq!(report["skipped"], false);
    }

    #[tokio::test]
    async fn test_empty_subtasks_falls_back_to_single_task() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result(r#"{"subtasks": []}"#));
        let (result, store, state) = run_decompose(backend).await;
        let result = result.unwrap();

        assert_eq!(result.status, StageStatus::Pass);
        assert!(state.decompose_skipped);
        assert!(state.subtasks.is_empty());
        assert_eq!(store.content("t-1", "subtasks.json").unwrap(), "[]");
        assert_eq!(result.report.unwrap()["skipped"], true);
    }

    #[tokio::test]
    async fn test_unparseable_dag_is_terminal() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result("I would split this into parts."));
        let (result, _, _) = run_decompose(backend).await;
        assert!(matches!(
            result.unwrap_err(),
            EngineError::BadStructuredOutput { stage: StageId::Decompose, .. }
        ));
    }

    #[tokio::test]
    async fn test_cyclic_dag_is_terminal() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result(
            r#"{"subtasks": [
                {"id": "s1", "title": "a", "blocked_by": ["s2"]},
                {"id": "s2", "title": "b", "blocked_by": ["s1"]}
            ]}"#,
        ));
        let (result, _, _) = run_decompose(backend).await;
        assert!(matches!(result.unwrap_err(), EngineError::Decompose { .. }));
    }
}
