//! Integrate: merge every subtask worktree back into one, with a
//! conflict-resolution escalation and a literal manual runbook when that
//! also fails.

use async_trait::async_trait;

use shipwright_utils::error::EngineError;
use shipwright_utils::types::StageId;

use crate::ports::MergeOutcome;
use crate::stage::{Stage, StageContext, StageResult};

#[derive(Debug, Clone)]
pub struct IntegrateStage;

impl IntegrateStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn runbook(task_id: &str, projects: &[String], files: &[String]) -> String {
        let mut runbook = format!(
            "# Manual merge resolution for task {task_id}\n\n\
             Automatic worktree merge and agent conflict resolution both failed. All \
             work is preserved on disk; nothing was discarded.\n\n\
             ## Conflicted files\n\n"
        );
        for file in files {
            runbook.push_str(&format!("- {file}\n"));
        }
        runbook.push_str("\n## Steps\n\n");
        runbook.push_str(&format!(
            "1. Inspect each subtask worktree under the task root: {}.\n",
            projects.join(", "),
        ));
        runbook.push_str(
            "2. Resolve the conflicted files by hand, keeping each subtask's intent.\n\
             3. Commit the resolution in the main worktree.\n\
             4. Re-run the task from the verify stage.\n",
        );
        runbook
    }
}

impl Default for IntegrateStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for IntegrateStage {
    fn id(&self) -> StageId {
        StageId::Integrate
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        if ctx.state.subtasks.is_empty() || ctx.state.decompose_skipped {
            return Ok(StageResult::skip("no subtask worktrees to merge"));
        }

        let task_id = ctx.state.task.id.clone();
        let projects: Vec<String> = ctx.state.subtasks.iter().map(|s| s.id.clone()).collect();

        match ctx.store.merge_worktrees(&task_id, &projects).await? {
            MergeOutcome::Clean => {
                return Ok(StageResult::pass(format!(
                    "merged {} worktrees cleanly",
                    projects.len()
                )));
            }
            MergeOutcome::Conflicts { files } => {
                // A dedicated resolution call gets the conflicted files and
                // authority to resolve and commit.
                let mut prompt = format!(
                    "The merge of task {task_id}'s subtask worktrees stopped on conflicts. \
                     Resolve every conflicted file listed below in the current working \
                     directory, preserving the intent of each subtask, then commit the \
                     resolution.\n\n# Conflicted files\n\n"
                );
                for file in &files {
                    prompt.push_str(&format!("- {file}\n"));
                }
                let request = ctx.request(prompt);
                let resolution = ctx.invoke(&request).await;

                if resolution.is_done() {
                    if let MergeOutcome::Clean =
                        ctx.store.merge_worktrees(&task_id, &projects).await?
                    {
                        return Ok(StageResult::pass(format!(
                            "merged {} worktrees after agent conflict resolution",
                            projects.len()
                        )));
                    }
                }

                let runbook = Self::runbook(&task_id, &projects, &files);
                ctx.save("integration-runbook.md", &runbook).await?;
                Err(EngineError::MergeConflict { runbook })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageStatus, Subtask, TaskSpec, TaskState};
    use crate::testing::{MemoryArtifactStore, ScriptedBackend};
    use shipwright_config::Config;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn state_with_subtasks() -> TaskState {
        let mut state = TaskState::new(TaskSpec::new("t-1", "build importer", "large"));
        state.subtasks = vec![
            Subtask {
                id: "s1".to_string(),
                title: "a".to_string(),
                description: String::new(),
                blocked_by: vec![],
                estimated_files: vec![],
            },
            Subtask {
                id: "s2".to_string(),
                title: "b".to_string(),
                description: String::new(),
                blocked_by: vec![],
                estimated_files: vec![],
            },
        ];
        state
    }

    async fn run_integrate(
        backend: Arc<ScriptedBackend>,
        state: &mut TaskState,
        store: Arc<MemoryArtifactStore>,
    ) -> Result<StageResult, EngineError> {
        let config = Arc::new(Config::load_from(None, &HashMap::new()).unwrap());
        let decl = config.pipeline_for_label("large").unwrap().clone();
        let spec = decl.stage(StageId::Integrate).unwrap();
        let mut ctx = StageContext {
            state,
            store,
            knowledge: None,
            agent: backend,
            config,
            spec,
        };
        IntegrateStage::new().run(&mut ctx).await
    }

    #[tokio::test]
    async fn test_clean_merge_passes() {
        let store = Arc::new(MemoryArtifactStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let mut state = state_with_subtasks();

        let result = run_integrate(backend.clone(), &mut state, store.clone())
            .await
            .unwrap();

        assert_eq!(result.status, StageStatus::Pass);
        assert_eq!(store.merge_calls(), vec![vec!["s1", "s2"]]);
        // No agent involvement on a clean merge.
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_single_task_skips() {
        let store = Arc::new(MemoryArtifactStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let mut state = TaskState::new(TaskSpec::new("t-1", "small fix", "large"));
        state.decompose_skipped = true;

        let result = run_integrate(backend, &mut state, store).await.unwrap();
        assert_eq!(result.status, StageStatus::Skip);
    }

    #[tokio::test]
    async fn test_conflicts_resolved_by_agent() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.script_merge(MergeOutcome::Conflicts {
            files: vec!["src/lib.rs".to_string()],
        });
        // Second merge (after resolution) is clean by default.
        let backend = Arc::new(ScriptedBackend::default_done("resolved and committed"));
        let mut state = state_with_subtasks();

        let result = run_integrate(backend.clone(), &mut state, store.clone())
            .await
            .unwrap();

        assert_eq!(result.status, StageStatus::Pass);
        assert!(result.output.contains("conflict resolution"));
        assert_eq!(store.merge_calls().len(), 2);
        assert!(backend.recorded_prompts()[0].contains("src/lib.rs"));
    }

    #[tokio::test]
    async fn test_failed_resolution_surfaces_runbook() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.script_merge(MergeOutcome::Conflicts {
            files: vec!["src/lib.rs".to_string(), "src/io.rs".to_string()],
        });
        let backend = Arc::new(ScriptedBackend::new());
        backend.push(ScriptedBackend::failed_result("agent gave up"));
        let mut state = state_with_subtasks();

        let err = run_integrate(backend, &mut state, store.clone())
            .await
            .unwrap_err();

        let EngineError::MergeConflict { runbook } = err else {
            panic!("expected MergeConflict");
        };
        assert!(runbook.contains("src/io.rs"));
        assert!(runbook.contains("preserved on disk"));
        // The runbook is also persisted as an artifact.
        assert_eq!(
            store.content("t-1", "integration-runbook.md").unwrap(),
            runbook
        );
    }

    #[tokio::test]
    async fn test_still_conflicted_after_resolution_surfaces_runbook() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.script_merge(MergeOutcome::Conflicts {
            files: vec!["src/lib.rs".to_string()],
        });
        store.script_merge(MergeOutcome::Conflicts {
            files: vec!["src/lib.rs".to_string()],
        });
        let backend = Arc::new(ScriptedBackend::default_done("tried my best"));
        let mut state = state_with_subtasks();

        let err = run_integrate(backend, &mut state, store).await.unwrap_err();
        assert!(matches!(err, EngineError::MergeConflict { .. }));
    }
}
