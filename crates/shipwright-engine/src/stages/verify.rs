//! Verify: the dual-gate check. An agent-executed test pass and an LLM
//! self-review must both pass, with zero critical issues, or the stage
//! fails with one consolidated feedback document.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use shipwright_utils::error::EngineError;
use shipwright_utils::json::extract_json_as;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult};
use crate::stages::{ReviewIssue, run_test_gate};

/// Fixed security checklist applied by the self-review.
const SECURITY_CHECKLIST: &str = "\
- injection (command, SQL, template)\n\
- hardcoded secrets or credentials\n\
- path traversal\n\
- unsafe deserialization of untrusted input";

#[derive(Debug, Deserialize)]
struct ReviewReport {
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    issues: Vec<ReviewIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Clone)]
pub struct VerifyStage;

impl VerifyStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for VerifyStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for VerifyStage {
    fn id(&self) -> StageId {
        StageId::Verify
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let tests = run_test_gate(ctx).await?;

        let spec = ctx.load_optional("spec.md").await?;
        let design = ctx.load_optional("design.md").await?;
        let notes = ctx.load_optional("notes.md").await?;
        let diff = match ctx
            .store
            .worktree_diff(&ctx.state.task.id, &ctx.state.task.id)
            .await
        {
            Ok(diff) if !diff.is_empty() => Some(diff),
            _ => None,
        };

        let mut review_prompt = format!(
            "Review the implementation of task {} for completeness against its \
             specification and design, unhandled edge cases, and this security \
             checklist:\n{SECURITY_CHECKLIST}\n\nReply with JSON only, shaped \
             {{\"complete\": bool, \"issues\": [{{\"severity\": \
             \"critical\"|\"major\"|\"minor\", \"description\": \"...\", \"file\": \
             \"...\", \"suggestion\": \"...\"}}], \"summary\": \"...\"}}.\n\n\
             # Task\n\n{}\n",
            ctx.state.task.id, ctx.state.task.description,
        );
        if let Some(spec) = &spec {
            review_prompt.push_str(&format!("\n# Specification\n\n{spec}\n"));
        }
        if let Some(design) = &design {
            review_prompt.push_str(&format!("\n# Design\n\n{design}\n"));
        }
        if let Some(notes) = &notes {
            review_prompt.push_str(&format!("\n# Implementation notes\n\n{notes}\n"));
        }
        if let Some(diff) = &diff {
            review_prompt.push_str(&format!("\n# Diff\n\n{diff}\n"));
        }

        let review_text = ctx.invoke_done(review_prompt).await?;
        let review: ReviewReport =
            extract_json_as(&review_text).map_err(|source| EngineError::BadStructuredOutput {
                stage: StageId::Verify,
                source,
            })?;

        let critical: Vec<&ReviewIssue> =
            review.issues.iter().filter(|i| i.is_critical()).collect();
        let passed = tests.passed && review.complete && critical.is_empty();

        let report = json!({
            "passed": passed,
            "tests": {
                "executed": tests.executed,
                "passed": tests.passed,
                "total": tests.total,
                "failed": tests.failed,
                "failures": tests.failures,
                "note": tests.note,
            },
            "review": {
                "complete": review.complete,
                "critical_issues": critical.len(),
                "issues": review.issues,
                "summary": review.summary,
            },
        });
        ctx.save(
            "verify-report.json",
            &serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string()),
        )
        .await?;

        if passed {
            return Ok(StageResult::pass(format!(
                "both gates passed ({} tests, {} issues, none critical)",
                tests.total,
                review.issues.len(),
            ))
            .with_report(report));
        }

        // One consolidated feedback document for the next implement
        // attempt.
        let mut feedback = format!("# Verification feedback for task {}\n", ctx.state.task.id);
        if !tests.passed {
            feedback.push_str(&format!(
                "\n## Failing tests ({} of {})\n\n",
                tests.failed, tests.total
            ));
            for failure in &tests.failures {
                feedback.push_str(&format!("- {failure}\n"));
            }
        }
        if !review.complete {
            feedback.push_str("\n## Completeness\n\nThe self-review judged the implementation incomplete.\n");
        }
        if !review.issues.is_empty() {
            feedback.push_str("\n## Review issues\n\n");
            for issue in &review.issues {
                feedback.push_str(&format!(
                    "- [{}] {}{}{}\n",
                    issue.severity,
                    issue.description,
                    issue
                        .file
                        .as_deref()
                        .map(|f| format!(" ({f})"))
                        .unwrap_or_default(),
                    issue
                        .suggestion
                        .as_deref()
                        .map(|s| format!(" — {s}"))
                        .unwrap_or_default(),
                ));
            }
        }
        if !review.summary.is_empty() {
            feedback.push_str(&format!("\n## Summary\n\n{}\n", review.summary));
        }
        ctx.save("verify-feedback.md", &feedback).await?;

        Ok(StageResult::fail(
            format!(
                "gate failed (tests passed: {}, review complete: {}, critical issues: {})",
                tests.passed,
                review.complete,
                critical.len(),
            ),
            feedback,
        )
        .with_report(report))
    }
}
