//! Specify: turn the task description into a specification document,
//! self-checked for gaps.

use async_trait::async_trait;

use shipwright_utils::error::EngineError;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult};
use crate::stages::{OUTPUT_RULES, run_gap_report};

#[derive(Debug, Clone)]
pub struct SpecifyStage;

impl SpecifyStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn prompt(
        ctx: &StageContext<'_>,
        decisions: Option<&str>,
        gaps: Option<&[String]>,
    ) -> String {
        let mut prompt = format!(
            "You are a requirements analyst. Write the complete specification for the \
             task below as a markdown document starting with '# Specification': an \
             overview, numbered functional requirements, edge cases, and explicit \
             non-goals. Be specific and testable; describe WHAT the system does, not \
             HOW.\n\n# Task\n\n{}\n",
            ctx.state.task.description,
        );
        if let Some(decisions) = decisions {
            prompt.push_str(&format!("\n# Working decisions\n\n{decisions}\n"));
        }
        if let Some(gaps) = gaps {
            prompt.push_str("\n# Gaps found in the previous draft — close every one\n\n");
            for gap in gaps {
                prompt.push_str(&format!("- {gap}\n"));
            }
        }
        prompt.push_str(OUTPUT_RULES);
        prompt
    }
}

impl Default for SpecifyStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for SpecifyStage {
    fn id(&self) -> StageId {
        StageId::Specify
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let decisions = ctx.load_optional("decisions.json").await?;

        let mut document = ctx
            .invoke_done(Self::prompt(ctx, decisions.as_deref(), None))
            .await?;

        // The gap report is a validation-gap soft failure: recorded as a
        // warning and retried a bounded number of times, never an abort.
        let mut regenerations = 0u32;
        loop {
            let gaps = run_gap_report(ctx, "specification", &document).await?;
            if gaps.is_empty() {
                break;
            }
            ctx.state.add_warning(format!(
                "specify gap report found {} gap(s): {}",
                gaps.len(),
                gaps.join("; "),
            ));
            if regenerations >= ctx.config.gap_retry_limit {
                break;
            }
            regenerations += 1;
            document = ctx
                .invoke_done(Self::prompt(ctx, decisions.as_deref(), Some(&gaps)))
                .await?;
        }

        ctx.save("spec.md", &document).await?;
        Ok(StageResult::pass(format!(
            "wrote spec.md ({} regenerations)",
            regenerations
        )))
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

    async fn run_specify(
        backend: ScriptedBackend,
    ) -> (StageResult, Arc<MemoryArtifactStore>, TaskState, Arc<ScriptedBackend>) {
        let config = Arc::new(Config::load_from(None, &HashMap::new()).unwrap());
        let decl = config.pipeline_for_label("medium").unwrap().clone();
        let spec = decl.stage(StageId::Specify).unwrap();
        let store = Arc::new(MemoryArtifactStore::new());
        store.seed("t-1", "decisions.json", r#"{"decisions": ["retry 3 times"]}"#);
        let backend = Arc::new(backend);
        let mut state = TaskState::new(TaskSpec::new("t-1", "add retry logic", "medium"));
        let mut ctx = StageContext {
            state: &mut state,
            store: store.clone(),
            knowledge: None,
            agent: backend.clone(),
            config,
            spec,
        };
        let result = SpecifyStage::new().run(&mut ctx).await.unwrap();
        (result, store, state, backend)
    }

    #[tokio::test]
    async fn test_clean_gap_report_passes_first_time() {
        let backend = ScriptedBackend::new();
        backend.push(ScriptedBackend::done_result("# Specification\n\nretries happen"));
        backend.push(ScriptedBackend::done_result(r#"{"gaps": []}"#));
        let (result, store, state, backend) = run_specify(backend).await;

        assert_eq!(result.status, StageStatus::Pass);
        assert!(store.content("t-1", "spec.md").unwrap().contains("retries"));
        assert!(state.warnings.is_empty());
        // generation + gap check
        assert_eq!(backend.request_count(), 2);
        // The working decisions were embedded in the generation prompt.
        assert!(backend.recorded_prompts()[0].contains("retry 3 times"));
    }

    #[tokio::test]
    async fn test_gaps_warn_and_regenerate_bounded() {
        let backend = ScriptedBackend::new();
        // draft 1 → 1 gap → draft 2 → 1 gap → draft 3 → 1 gap → stop
        // (gap_retry_limit = 2 regenerations).
        backend.push(ScriptedBackend::done_result("# Specification v1"));
        backend.push(ScriptedBackend::done_result(r#"{"gaps": ["timeout unspecified"]}"#));
        backend.push(ScriptedBackend::done_result("# Specification v2"));
        backend.push(ScriptedBackend::done_result(r#"{"gaps": ["still unspecified"]}"#));
        backend.push(ScriptedBackend::done_result("# Specification v3"));
        backend.push(ScriptedBackend::done_result(r#"{"gaps": ["hopeless"]}"#));
        let (result, store, state, backend) = run_specify(backend).await;

        assert_eq!(result.status, StageStatus::Pass);
        // Accepted with warnings rather than aborting.
        assert_eq!(state.warnings.len(), 3);
        assert_eq!(store.content("t-1", "spec.md").unwrap(), "# Specification v3");
        assert_eq!(backend.request_count(), 6);
        // The regeneration prompt carried the gap feedback.
        assert!(backend.recorded_prompts()[2].contains("timeout unspecified"));
    }
}
