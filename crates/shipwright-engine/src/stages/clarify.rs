//! Clarify: surface questions and record the working decisions.

use async_trait::async_trait;
use serde_json::Value;

use shipwright_utils::error::EngineError;
use shipwright_utils::json::extract_json;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult};

/// First stage of every non-trivial pipeline. The output
/// (`decisions.json`) is embedded into later prompts so the whole run
/// proceeds under one explicit set of assumptions.
#[derive(Debug, Clone)]
pub struct ClarifyStage;

impl ClarifyStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for ClarifyStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for ClarifyStage {
    fn id(&self) -> StageId {
        StageId::Clarify
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let prompt = format!(
            "You are the delivery lead for task {}. Before any specification is written, \
             surface what is unclear.\n\n# Task\n\n{}\n\n# Your job\n\n\
             List the clarifying questions worth asking, the assumptions you will proceed \
             under where no answer is available, and the resulting working decisions. \
             Reply with JSON only, shaped:\n\
             {{\"questions\": [\"...\"], \"assumptions\": [\"...\"], \"decisions\": [\"...\"]}}",
            ctx.state.task.id, ctx.state.task.description,
        );
        let text = ctx.invoke_done(prompt).await?;

        let (document, summary) = match extract_json(&text) {
            Ok(value) => {
                let decisions = count(&value, "decisions");
                let assumptions = count(&value, "assumptions");
                let questions = count(&value, "questions");
                (
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
                    format!(
                        "recorded {decisions} decisions, {assumptions} assumptions, {questions} open questions"
                    ),
                )
            }
            Err(_) => {
                ctx.state
                    .add_warning("clarify output was not structured; recording raw notes");
                let wrapped = serde_json::json!({ "notes": text });
                (
                    serde_json::to_string_pretty(&wrapped)
                        .unwrap_or_else(|_| wrapped.to_string()),
                    "clarify output unstructured; recorded as notes".to_string(),
                )
            }
        };

        ctx.save("decisions.json", &document).await?;
        Ok(StageResult::pass(summary))
    }
}

fn count(value: &Value, key: &str) -> usize {
    value.get(key).and_then(Value::as_array).map_or(0, Vec::len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageStatus, TaskSpec, TaskState};
    use crate::testing::{MemoryArtifactStore, ScriptedBackend};
    use shipwright_config::Config;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn run_clarify(backend: ScriptedBackend) -> (StageResult, Arc<MemoryArtifactStore>, TaskState) {
        let config = Arc::new(Config::load_from(None, &HashMap::new()).unwrap());
        let decl = config.pipeline_for_label("medium").unwrap().clone();
        let spec = decl.stage(StageId::Clarify).unwrap();
        let store = Arc::new(MemoryArtifactStore::new());
        let mut state = TaskState::new(TaskSpec::new("t-1", "add retry logic", "medium"));
        let mut ctx = StageContext {
            state: &mut state,
            store: store.clone(),
            knowledge: None,
            agent: Arc::new(backend),
            config,
            spec,
        };
        let result = ClarifyStage::new().run(&mut ctx).await.unwrap();
        (result, store, state)
    }

    #[tokio::test]
    async fn test_structured_decisions_saved() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result(
            r#"{"questions": ["which backoff?"], "assumptions": ["exponential"], "decisions": ["retry 3 times", "cap at 30s"]}"#,
        ));
        let (result, store, state) = run_clarify(backend).await;

        assert_eq!(result.status, StageStatus::Pass);
        assert!(result.output.contains("2 decisions"));
        let saved = store.content("t-1", "decisions.json").unwrap();
        assert!(saved.contains("retry 3 times"));
        assert!(state.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_unstructured_output_recorded_with_warning() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result(
            "I think we should just retry three times.",
        ));
        let (result, store, state) = run_clarify(backend).await;

        assert_eq!(result.status, StageStatus::Pass);
        let saved = store.content("t-1", "decisions.json").unwrap();
        assert!(saved.contains("notes"));
        assert_eq!(state.warnings.len(), 1);
    }
}
