//! Deliver: terminal stage; writes the delivery report and hands off.

use async_trait::async_trait;
use chrono::Utc;

use shipwright_utils::error::EngineError;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult};

#[derive(Debug, Clone)]
pub struct DeliverStage;

impl DeliverStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for DeliverStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for DeliverStage {
    fn id(&self) -> StageId {
        StageId::Deliver
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let state = &ctx.state;
        let mut report = format!(
            "# Delivery report: task {}\n\nGenerated {}\n\n## Task\n\n{}\n\n\
             ## Pipeline\n\n- label: {}\n- subtasks: {}\n",
            state.task.id,
            Utc::now().to_rfc3339(),
            state.task.description,
            state.task.label,
            state.subtasks.len(),
        );
        if state.decompose_skipped {
            report.push_str("- decompose fell back to single-task execution\n");
        }

        if let Some(verify) = ctx.load_optional("verify-report.json").await? {
            report.push_str(&format!("\n## Verification\n\n```json\n{verify}\n```\n"));
        }

        report.push_str(&format!(
            "\n## Token usage\n\n- input: {}\n- output: {}\n",
            state.usage.input, state.usage.output,
        ));

        if state.warnings.is_empty() {
            report.push_str("\n## Warnings\n\nnone\n");
        } else {
            report.push_str("\n## Warnings\n\n");
            for warning in &state.warnings {
                report.push_str(&format!("- {warning}\n"));
            }
        }

        ctx.save("delivery-report.md", &report).await?;
        Ok(StageResult::pass(format!(
            "delivered with {} warning(s)",
            ctx.state.warnings.len()
        )))
    }
}
