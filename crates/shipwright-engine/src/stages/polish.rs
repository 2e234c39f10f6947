//! Polish: the bounded review→fix→test convergence loop.
//!
//! Iterates the fixed ordered lens list; per lens, review→fix→test-gate
//! repeats until two consecutive zero-issue rounds (converged), a per-lens
//! cap, or a global cap across all lenses. A token-budget check can abort
//! the whole loop between rounds. Polish is best-effort: it passes with
//! whatever convergence it reached, and every cut is recorded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use shipwright_utils::error::EngineError;
use shipwright_utils::json::extract_json_as;
use shipwright_utils::types::StageId;

use crate::stage::{Stage, StageContext, StageResult};
use crate::stages::{ReviewIssue, run_test_gate};

/// One append-only review-round artifact (`polish-<lens>-round-<n>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensReviewRound {
    pub lens: String,
    pub round: u32,
    pub issues: Vec<ReviewIssue>,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
struct LensReview {
    #[serde(default)]
    issues: Vec<ReviewIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Serialize)]
struct LensOutcome {
    lens: String,
    rounds: u32,
    converged: bool,
}

#[derive(Debug, Clone)]
pub struct PolishStage;

impl PolishStage {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn lens_guidance(lens: &str) -> &'static str {
        match lens {
            "code-quality" => "dead code, duplication, naming, error-handling hygiene",
            "design-consistency" => "divergence between the design documents and the implementation",
            "testing" => "missing or weak test coverage for the changed behavior",
            "security" => "injection, hardcoded secrets, path traversal, unsafe deserialization",
            _ => "defects visible through this lens",
        }
    }

    async fn review_lens(
        ctx: &mut StageContext<'_>,
        lens: &str,
        round: u32,
    ) -> Result<LensReviewRound, EngineError> {
        let prompt = format!(
            "Review the implementation of task {} through the '{lens}' lens (round \
             {round}): look for {guidance}. Reply with JSON only, shaped \
             {{\"issues\": [{{\"severity\": \"critical\"|\"major\"|\"minor\", \
             \"description\": \"...\", \"file\": \"...\", \"suggestion\": \"...\"}}], \
             \"summary\": \"...\"}}; use an empty issues array when the lens is clean.",
            ctx.state.task.id,
            guidance = Self::lens_guidance(lens),
        );
        let text = ctx.invoke_done(prompt).await?;
        let review = match extract_json_as::<LensReview>(&text) {
            Ok(review) => review,
            Err(_) => {
                ctx.state.add_warning(format!(
                    "polish review for lens '{lens}' round {round} was unparseable; treating as clean"
                ));
                LensReview {
                    issues: Vec::new(),
                    summary: String::new(),
                }
            }
        };
        Ok(LensReviewRound {
            lens: lens.to_string(),
            round,
            issues: review.issues,
            summary: review.summary,
        })
    }

    async fn fix_issues(
        ctx: &mut StageContext<'_>,
        lens: &str,
        round: &LensReviewRound,
    ) -> Result<(), EngineError> {
        let mut prompt = format!(
            "Fix every issue below, found reviewing task {} through the '{lens}' lens. \
             Keep the build and tests green.\n\n# Issues\n\n",
            ctx.state.task.id,
        );
        for issue in &round.issues {
            prompt.push_str(&format!(
                "- [{}] {}{}\n",
                issue.severity,
                issue.description,
                issue
                    .suggestion
                    .as_deref()
                    .map(|s| format!(" — {s}"))
                    .unwrap_or_default(),
            ));
        }
        ctx.invoke_done(prompt).await?;
        Ok(())
    }

    async fn fix_test_failures(
        ctx: &mut StageContext<'_>,
        failures: &[String],
    ) -> Result<(), EngineError> {
        let mut prompt = format!(
            "The test suite regressed after the last fix for task {}. Repair the failing \
             tests without undoing the fix.\n\n# Failures\n\n",
            ctx.state.task.id,
        );
        for failure in failures {
            prompt.push_str(&format!("- {failure}\n"));
        }
        ctx.invoke_done(prompt).await?;
        Ok(())
    }
}

impl Default for PolishStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for PolishStage {
    fn id(&self) -> StageId {
        StageId::Polish
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageResult, EngineError> {
        let polish = ctx.config.polish.clone();
        if polish.lenses.is_empty() {
            return Ok(StageResult::skip("no polish lenses configured"));
        }

        let budget = ctx.config.token_budget;
        let mut total_rounds = 0u32;
        let mut aborted_for_budget = false;
        let mut outcomes: Vec<LensOutcome> = Vec::new();

        'lenses: for lens in &polish.lenses {
            let mut rounds = 0u32;
            let mut clean_streak = 0u32;
            let mut converged = false;

            while rounds < polish.per_lens_cap {
                if budget > 0
                    && ctx.state.budget_fraction(budget) >= polish.budget_abort_fraction
                {
                    ctx.state.add_warning(format!(
                        "polish aborted at {:.0}% of the token budget",
                        ctx.state.budget_fraction(budget) * 100.0,
                    ));
                    aborted_for_budget = true;
                    outcomes.push(LensOutcome {
                        lens: lens.clone(),
                        rounds,
                        converged,
                    });
                    break 'lenses;
                }
                if total_rounds >= polish.global_cap {
                    outcomes.push(LensOutcome {
                        lens: lens.clone(),
                        rounds,
                        converged,
                    });
                    break 'lenses;
                }

                rounds += 1;
                total_rounds += 1;

                let round = Self::review_lens(ctx, lens, rounds).await?;
                ctx.save(
                    &format!("polish-{lens}-round-{rounds}.json"),
                    &serde_json::to_string_pretty(&round)
                        .unwrap_or_else(|_| "{}".to_string()),
                )
                .await?;

                if round.issues.is_empty() {
                    clean_streak += 1;
                    if clean_streak >= polish.converged_rounds {
                        converged = true;
                        break;
                    }
                    continue;
                }
                clean_streak = 0;

                Self::fix_issues(ctx, lens, &round).await?;

                let gate = run_test_gate(ctx).await?;
                if gate.executed && !gate.passed {
                    // One additional repair call, then resume the lens.
                    Self::fix_test_failures(ctx, &gate.failures).await?;
                }
            }

            outcomes.push(LensOutcome {
                lens: lens.clone(),
                rounds,
                converged,
            });
        }

        let converged_lenses = outcomes.iter().filter(|o| o.converged).count();
        let lens_count = outcomes.len();
        let report = json!({
            "lenses": outcomes,
            "total_rounds": total_rounds,
            "aborted_for_budget": aborted_for_budget,
        });
        Ok(StageResult::pass(format!(
            "{converged_lenses}/{lens_count} lenses converged in {total_rounds} rounds{}",
            if aborted_for_budget {
                " (budget abort)"
            } else {
                ""
            },
        ))
        .with_report(report))
    }
}
