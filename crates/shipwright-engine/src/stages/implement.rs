//! Implement: drive the agent to make the actual changes, one subtask at
//! a time when the task was decomposed.

use async_trait::async_trait;

use shipwright_utils::error::EngineError;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult, Subtask};

#[derive(Debug, Clone)]
pub struct ImplementStage;

impl ImplementStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn base_prompt(
        ctx: &StageContext<'_>,
        spec: Option<&str>,
        design: Option<&str>,
        feedback: Option<&str>,
        knowledge: &str,
    ) -> String {
        let mut prompt = format!(
            "Implement task {} in the current working directory. Make the changes, keep \
             the build green, and finish with a short summary of what you changed and \
             why.\n\n# Task\n\n{}\n",
            ctx.state.task.id, ctx.state.task.description,
        );
        if !knowledge.is_empty() {
            prompt.push_str(&format!("\n{knowledge}"));
        }
        if let Some(spec) = spec {
            prompt.push_str(&format!("\n# Specification\n\n{spec}\n"));
        }
        if let Some(design) = design {
            prompt.push_str(&format!("\n# Design\n\n{design}\n"));
        }
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n# Verification feedback from the previous attempt — address every item\n\n{feedback}\n"
            ));
        }
        prompt
    }

    fn subtask_prompt(base: &str, subtask: &Subtask, design: Option<&str>) -> String {
        let mut prompt = format!(
            "{base}\n# Current subtask: {} ({})\n\n{}\n\nWork only on this subtask; its \
             worktree is isolated from the other subtasks.\n",
            subtask.id, subtask.title, subtask.description,
        );
        if let Some(design) = design {
            prompt.push_str(&format!("\n# Subtask design\n\n{design}\n"));
        }
        prompt
    }
}

impl Default for ImplementStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for ImplementStage {
    fn id(&self) -> StageId {
        StageId::Implement
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let spec = ctx.load_optional("spec.md").await?;
        let design = ctx.load_optional("design.md").await?;
        let feedback = ctx.load_optional("verify-feedback.md").await?;
        let knowledge = ctx
            .knowledge_context(&ctx.state.task.description, 3)
            .await;
        let base = Self::base_prompt(
            ctx,
            spec.as_deref(),
            design.as_deref(),
            feedback.as_deref(),
            &knowledge,
        );

        if ctx.state.subtasks.is_empty() {
            let summary = ctx.invoke_done(base).await?;
            ctx.save("notes.md", &summary).await?;
            return Ok(StageResult::pass("implemented task"));
        }

        // Sequential execution in wave order: scheduling hints only, never
        // two agents in the same worktree at once.
        let waves = ctx.state.waves.clone();
        let subtasks = ctx.state.subtasks.clone();
        let mut notes = String::from("# Implementation notes\n\n");
        let mut completed = 0usize;
        for wave in &waves {
            for id in wave {
                let Some(subtask) = subtasks.iter().find(|s| &s.id == id) else {
                    return Err(EngineError::Decompose {
                        reason: format!("wave references unknown subtask '{id}'"),
                    });
                };
                let sub_design = ctx
                    .load_optional(&format!("design-{}.md", subtask.id))
                    .await?;
                let mut request =
                    ctx.request(Self::subtask_prompt(&base, subtask, sub_design.as_deref()));
                // Each subtask runs in its isolated worktree, provisioned
                // by the daemon under the task's root.
                if let Some(root) = &ctx.state.task.working_dir {
                    request.working_dir = Some(root.join("worktrees").join(&subtask.id));
                }
                let result = ctx.invoke(&request).await;
                if !result.is_done() {
                    return Err(EngineError::Invocation {
                        stage: StageId::Implement,
                        status: result.status.as_str().to_string(),
                        detail: format!("subtask '{}' did not complete", subtask.id),
                    });
                }
                ctx.save(&format!("notes-{}.md", subtask.id), result.text())
                    .await?;
                notes.push_str(&format!("- `{}` ({}): done\n", subtask.id, subtask.title));
                completed += 1;
            }
        }

        ctx.save("notes.md", &notes).await?;
        Ok(StageResult::pass(format!(
            "implemented {completed} subtasks sequentially"
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

    fn subtask(id: &str, blocked_by: &[&str]) -> Subtask {
        Subtask {
            id: id.to_string(),
            title: format!("part {id}"),
            description: format!("do {id}"),
            blocked_by: blocked_by.iter().map(|s| (*s).to_string()).collect(),
            estimated_files: Vec::new(),
        }
    }

    async fn run_implement(
        backend: Arc<ScriptedBackend>,
        state: &mut TaskState,
        store: Arc<MemoryArtifactStore>,
    ) -> Result<StageResult, EngineError> {
        let config = Arc::new(Config::load_from(None, &HashMap::new()).unwrap());
        let decl = config.pipeline_for_label("trivial").unwrap().clone();
        let spec = decl.stage(StageId::Implement).unwrap();
        let mut ctx = StageContext {
            state,
            store,
            knowledge: None,
            agent: backend,
            config,
            spec,
        };
        ImplementStage::new().run(&mut ctx).await
    }

    #[tokio::test]
    async fn test_single_task_saves_notes() {
        let store = Arc::new(MemoryArtifactStore::new());
        let backend = Arc::new(ScriptedBackend::default_done("changed three files"));
        let mut state = TaskState::new(TaskSpec::new("t-1", "fix the bug", "trivial"));

        let result = run_implement(backend, &mut state, store.clone()).await.unwrap();

        assert_eq!(result.status, StageStatus::Pass);
        assert_eq!(store.content("t-1", "notes.md").unwrap(), "changed three files");
    }

    #[tokio::test]
    async fn test_prior_verify_feedback_embedded() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.seed("t-1", "verify-feedback.md", "edge case X is unhandled");
        let backend = Arc::new(ScriptedBackend::default_done("fixed"));
        let mut state = TaskState::new(TaskSpec::new("t-1", "fix the bug", "trivial"));

        run_implement(backend.clone(), &mut state, store).await.unwrap();

        let prompt = &backend.recorded_prompts()[0];
        assert!(prompt.contains("edge case X is unhandled"));
        assert!(prompt.contains("address every item"));
    }

    #[tokio::test]
    async fn test_subtasks_run_sequentially_in_wave_order() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.seed("t-1", "design-s1.md", "# Design: part s1");
        let backend = Arc::new(ScriptedBackend::default_done("subtask done"));
        let mut state = TaskState::new(
            TaskSpec::new("t-1", "build importer", "large").with_working_dir("/work/t-1"),
        );
        state.subtasks = vec![subtask("s1", &[]), subtask("s2", &["s1"])];
        state.waves = vec![vec!["s1".to_string()], vec!["s2".to_string()]];

        let result = run_implement(backend.clone(), &mut state, store.clone())
            .await
            .unwrap();

        assert_eq!(result.status, StageStatus::Pass);
        assert!(store.content("t-1", "notes-s1.md").is_some());
        assert!(store.content("t-1", "notes-s2.md").is_some());
        assert!(store.content("t-1", "notes.md").unwrap().contains("`s2`"));

        let requests = backend.recorded_requests();
        assert_eq!(requests.len(), 2);
        // Wave order, isolated worktrees.
        assert!(requests[0].prompt.contains("Current subtask: s1"));
        assert!(requests[1].prompt.contains("Current subtask: s2"));
        assert_eq!(
            requests[0].working_dir.as_deref(),
            Some(std::path::Path::new("/work/t-1/worktrees/s1"))
        );
        // The per-subtask design was embedded.
        assert!(requests[0].prompt.contains("# Design: part s1"));
    }

    #[tokio::test]
    async fn test_failed_subtask_aborts_stage() {
        let store = Arc::new(MemoryArtifactStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(ScriptedBackend::failed_result("compile error"));
        let mut state = TaskState::new(TaskSpec::new("t-1", "build importer", "large"));
        state.subtasks = vec![subtask("s1", &[])];
        state.waves = vec![vec!["s1".to_string()]];

        let err = run_implement(backend, &mut state, store).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Invocation { stage: StageId::Implement, .. }
        ));
    }
}
