//! Design: produce design documents, optionally one per subtask, with
//! prior knowledge prepended and an optional convergence pass.

use async_trait::async_trait;
use std::sync::Arc;

use shipwright_utils::error::EngineError;
use shipwright_utils::types::StageId;

use crate::converge::{ConvergeOptions, ConvergeRunner};
use crate::stage::{Stage, StageContext, StageResult, Subtask};
use crate::stages::{OUTPUT_RULES, run_gap_report};

#[derive(Debug, Clone)]
pub struct DesignStage;

impl DesignStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn single_prompt(
        ctx: &StageContext<'_>,
        spec: &str,
        knowledge: &str,
        gaps: Option<&[String]>,
    ) -> String {
        let mut prompt = format!(
            "You are the software architect for task {}. Write the design as a markdown \
             document starting with '# Design': architecture, components, interfaces, \
             data structures, and error handling. Ground every element in the \
             specification.\n\n{knowledge}# Specification\n\n{spec}\n",
            ctx.state.task.id,
        );
        if let Some(gaps) = gaps {
            prompt.push_str("\n# Coverage gaps in the previous draft — close every one\n\n");
            for gap in gaps {
                prompt.push_str(&format!("- {gap}\n"));
            }
        }
        prompt.push_str(OUTPUT_RULES);
        prompt
    }

    fn subtask_prompt(spec: &str, knowledge: &str, subtask: &Subtask) -> String {
        format!(
            "You are the software architect for subtask {id} ({title}). Write its design \
             as a markdown document starting with '# Design: {title}', covering only this \
             subtask's scope: components, interfaces, data structures, error handling. \
             Stay consistent with the overall specification.\n\n{knowledge}\
             # Subtask\n\n{description}\n\n# Expected files\n\n{files}\n\n\
             # Specification\n\n{spec}{OUTPUT_RULES}",
            id = subtask.id,
            title = subtask.title,
            description = subtask.description,
            files = if subtask.estimated_files.is_empty() {
                "(not estimated)".to_string()
            } else {
                subtask.estimated_files.join("\n")
            },
        )
    }
}

impl Default for DesignStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for DesignStage {
    fn id(&self) -> StageId {
        StageId::Design
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let spec = ctx.load("spec.md").await?;
        let knowledge = ctx
            .knowledge_context(&ctx.state.task.description, 3)
            .await;

        if ctx.state.subtasks.is_empty() {
            return self.design_single(ctx, &spec, &knowledge).await;
        }
        self.design_per_subtask(ctx, &spec, &knowledge).await
    }
}

impl DesignStage {
    async fn design_single(
        &self,
        ctx: &mut StageContext<'_>,
        spec: &str,
        knowledge: &str,
    ) -> Result<StageResult, EngineError> {
        let mut document = if ctx.config.design_candidates > 1 {
            // Wide solution space: fan out candidate designs and converge.
            let runner = ConvergeRunner::new(Arc::clone(&ctx.agent), Arc::clone(&ctx.config));
            let opts = ConvergeOptions {
                count: Some(ctx.config.design_candidates),
                working_dir: ctx.state.task.working_dir.clone(),
                timeouts: shipwright_agent::Timeouts::idle_hard(
                    ctx.spec.idle_timeout,
                    ctx.spec.hard_timeout,
                ),
                ..Default::default()
            };
            let merged = runner
                .classify_and_aggregate(&Self::single_prompt(ctx, spec, knowledge, None), &opts)
                .await?;
            ctx.state.usage.absorb(merged.usage);
            merged.text
        } else {
            ctx.invoke_done(Self::single_prompt(ctx, spec, knowledge, None))
                .await?
        };

        let mut regenerations = 0u32;
        loop {
            let gaps = run_gap_report(ctx, "design", &document).await?;
            if gaps.is_empty() {
                break;
            }
            ctx.state.add_warning(format!(
                "design coverage report found {} gap(s): {}",
                gaps.len(),
                gaps.join("; "),
            ));
            if regenerations >= ctx.config.gap_retry_limit {
                break;
            }
            regenerations += 1;
            document = ctx
                .invoke_done(Self::single_prompt(ctx, spec, knowledge, Some(&gaps)))
                .await?;
        }

        ctx.save("design.md", &document).await?;
        Ok(StageResult::pass(format!(
            "wrote design.md ({} regenerations)",
            regenerations
        )))
    }

    async fn design_per_subtask(
        &self,
        ctx: &mut StageContext<'_>,
        spec: &str,
        knowledge: &str,
    ) -> Result<StageResult, EngineError> {
        let subtasks = ctx.state.subtasks.clone();
        let mut index = String::from("# Design\n\nPer-subtask design documents:\n\n");
        for subtask in &subtasks {
            let document = ctx
                .invoke_done(Self::subtask_prompt(spec, knowledge, subtask))
                .await?;
            let name = format!("design-{}.md", subtask.id);
            ctx.save(&name, &document).await?;
            index.push_str(&format!("- `{name}` — {}\n", subtask.title));
        }
        ctx.save("design.md", &index).await?;
        Ok(StageResult::pass(format!(
            "wrote {} subtask designs",
            subtasks.len()
        )))
    }
}
