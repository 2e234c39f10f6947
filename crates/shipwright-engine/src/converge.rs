//! Convergence: classify → spawn → aggregate.
//!
//! A convergence pass first asks the model to classify the task on two
//! axes — complexity (selects the model tier) and strategy (how survivors
//! are merged) — then fans out, reads every surviving output file inline,
//! and issues one final call that merges the survivors under
//! strategy-specific rules. The text helper here also owns the only
//! built-in retry policy: exponential backoff on rate-limited results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use shipwright_agent::{AgentBackend, AgentRequest, AgentResult, AgentStatus, Timeouts};
use shipwright_config::Config;
use shipwright_utils::error::EngineError;
use shipwright_utils::json::extract_json_as;
use shipwright_utils::types::TokenUsage;

use crate::fanout::{FanoutRunner, output_file_name};

/// Base delay for rate-limit backoff; doubles per attempt.
pub const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(5);
/// Retries after the first rate-limited result before the terminal error.
pub const RATE_LIMIT_MAX_RETRIES: u32 = 3;

/// Task complexity classification; selects the model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Light,
    Heavy,
}

/// Merge strategy classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fact-style task: survivors are near-duplicates; reconcile by
    /// majority and prefer the most specific detail.
    Converge,
    /// Opinion-style task: survivors conflict by design; synthesize a
    /// higher-order answer.
    Diverge,
}

/// Result of the classification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub complexity: Complexity,
    pub strategy: Strategy,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            complexity: Complexity::Light,
            strategy: Strategy::Converge,
        }
    }
}

/// Options for one convergence pass; unset fields fall back to the
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ConvergeOptions {
    pub count: Option<usize>,
    pub refine: Option<bool>,
    /// Directory the fan-out instances write their numbered files into.
    pub working_dir: Option<PathBuf>,
    pub timeouts: Timeouts,
}

/// The merged answer plus accounting.
#[derive(Debug, Clone)]
pub struct MergedOutput {
    pub text: String,
    pub usage: TokenUsage,
    pub classification: Classification,
    pub survivors: usize,
    /// 1 for a single pass, 2 when the refine round ran.
    pub rounds: u32,
}

#[derive(Debug, Deserialize)]
struct ClassifyReport {
    #[serde(default)]
    complexity: String,
    #[serde(default)]
    strategy: String,
}

/// Drives classify → fan-out → aggregate passes.
pub struct ConvergeRunner {
    agent: Arc<dyn AgentBackend>,
    config: Arc<Config>,
}

impl ConvergeRunner {
    #[must_use]
    pub fn new(agent: Arc<dyn AgentBackend>, config: Arc<Config>) -> Self {
        Self { agent, config }
    }

    /// Invoke once, retrying rate-limited results with exponential delay
    /// (5 s × 2^attempt) up to [`RATE_LIMIT_MAX_RETRIES`] times.
    ///
    /// # Errors
    ///
    /// [`EngineError::RateLimitExhausted`] after the final rate-limited
    /// attempt. Other statuses are returned to the caller verbatim.
    pub async fn invoke_text_with_backoff(
        &self,
        request: &AgentRequest,
    ) -> Result<AgentResult, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            let result = self.agent.invoke(request).await;
            if result.status != AgentStatus::RateLimited {
                return Ok(result);
            }
            if attempt >= RATE_LIMIT_MAX_RETRIES {
                return Err(EngineError::RateLimitExhausted {
                    attempts: attempt + 1,
                });
            }
            let delay = RATE_LIMIT_BASE_DELAY * 2u32.pow(attempt);
            debug!(attempt = attempt + 1, ?delay, "rate limited; backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Full convergence pass: classify, fan out, read survivors, merge,
    /// optionally refine.
    ///
    /// # Errors
    ///
    /// [`EngineError::Converge`] when no fan-out instance survives or the
    /// merge call does not complete; [`EngineError::RateLimitExhausted`]
    /// when backoff runs dry.
    pub async fn classify_and_aggregate(
        &self,
        prompt: &str,
        opts: &ConvergeOptions,
    ) -> Result<MergedOutput, EngineError> {
        let mut usage = TokenUsage::default();
        let classification = self.classify(prompt, opts, &mut usage).await?;

        let count = opts.count.unwrap_or(self.config.converge.fanout_count);
        let (text, survivors) = self
            .fan_and_merge(prompt, prompt, classification, count, opts, &mut usage)
            .await?;
        let mut merged = text;
        let mut rounds = 1;

        if opts.refine.unwrap_or(self.config.converge.refine) {
            let refine_prompt = format!(
                "Refine the draft below into its strongest version. Keep its structure \
                 unless a change clearly improves it.\n\n# Original instructions\n\n{prompt}\n\n\
                 # Draft\n\n{merged}"
            );
            match self
                .fan_and_merge(&refine_prompt, prompt, classification, count, opts, &mut usage)
                .await
            {
                Ok((refined, _)) => {
                    merged = refined;
                    rounds = 2;
                }
                Err(e) => {
                    warn!(error = %e, "refine round failed; keeping round-1 merge");
                }
            }
        }

        Ok(MergedOutput {
            text: merged,
            usage,
            classification,
            survivors,
            rounds,
        })
    }

    async fn classify(
        &self,
        prompt: &str,
        opts: &ConvergeOptions,
        usage: &mut TokenUsage,
    ) -> Result<Classification, EngineError> {
        let classify_prompt = format!(
            "Classify the task below on two axes and reply with JSON only, shaped \
             {{\"complexity\": \"light\"|\"heavy\", \"strategy\": \"converge\"|\"diverge\"}}.\n\
             complexity: heavy if the task needs deep reasoning or large context, light otherwise.\n\
             strategy: converge if independent answers should be near-duplicates (fact-style), \
             diverge if they will differ by perspective (opinion or design work).\n\n\
             # Task\n\n{prompt}"
        );
        let request = self.base_request(classify_prompt, &self.config.converge.light_model, opts);
        let result = self.invoke_text_with_backoff(&request).await?;
        usage.absorb(result.token_usage);

        if !result.is_done() {
            warn!(status = result.status.as_str(), "classification call did not complete; using defaults");
            return Ok(Classification::default());
        }
        match extract_json_as::<ClassifyReport>(result.text()) {
            Ok(report) => Ok(Classification {
                complexity: match report.complexity.as_str() {
                    "heavy" => Complexity::Heavy,
                    _ => Complexity::Light,
                },
                strategy: match report.strategy.as_str() {
                    "diverge" => Strategy::Diverge,
                    _ => Strategy::Converge,
                },
            }),
            Err(_) => {
                debug!("classification output unparseable; using defaults");
                Ok(Classification::default())
            }
        }
    }

    /// One fan-out-then-merge round. `original_prompt` is embedded in the
    /// merge call so the merger sees the true instructions even on refine
    /// rounds.
    async fn fan_and_merge(
        &self,
        fan_prompt: &str,
        original_prompt: &str,
        classification: Classification,
        count: usize,
        opts: &ConvergeOptions,
        usage: &mut TokenUsage,
    ) -> Result<(String, usize), EngineError> {
        let model = self.model_for(classification.complexity);
        let fan_request = self.base_request(fan_prompt.to_string(), model, opts);
        let runner = FanoutRunner::new(Arc::clone(&self.agent));
        let batch = runner.run_parallel(&fan_request, count).await;
        usage.absorb(batch.usage);

        let survivors = self.read_survivors(&batch, opts).await;
        if survivors.is_empty() {
            return Err(EngineError::Converge {
                status: "failed".to_string(),
                detail: format!(
                    "no fan-out instance survived ({} failed, {} rate-limited, {} timed out)",
                    batch.failed_ids.len(),
                    batch.rate_limited_ids.len(),
                    batch.timed_out_ids.len(),
                ),
            });
        }

        let merge_request = self.base_request(
            build_merge_prompt(original_prompt, &survivors, classification.strategy),
            model,
            opts,
        );
        let result = self.invoke_text_with_backoff(&merge_request).await?;
        usage.absorb(result.token_usage);
        if !result.is_done() {
            return Err(EngineError::Converge {
                status: result.status.as_str().to_string(),
                detail: "merge call did not complete".to_string(),
            });
        }
        Ok((result.text().to_string(), survivors.len()))
    }

    /// Read each survivor's numbered output file, falling back to its
    /// streamed final text when the file is missing.
    async fn read_survivors(
        &self,
        batch: &crate::fanout::FanoutBatch,
        opts: &ConvergeOptions,
    ) -> Vec<(usize, String)> {
        let mut survivors = Vec::new();
        for id in &batch.done_ids {
            if let Some(dir) = &opts.working_dir {
                if let Ok(content) = tokio::fs::read_to_string(dir.join(output_file_name(*id))).await
                {
                    survivors.push((*id, content));
                    continue;
                }
            }
            if let Some(result) = batch.results.get(id) {
                survivors.push((*id, result.text().to_string()));
            }
        }
        survivors
    }

    fn model_for(&self, complexity: Complexity) -> &str {
        match complexity {
            Complexity::Light => &self.config.converge.light_model,
            Complexity::Heavy => &self.config.converge.heavy_model,
        }
    }

    fn base_request(&self, prompt: String, model: &str, opts: &ConvergeOptions) -> AgentRequest {
        let mut request = AgentRequest::new(prompt)
            .with_provider(self.config.provider)
            .with_model(model)
            .with_tool_allow_list(self.config.tool_allow_list.clone())
            .with_timeouts(opts.timeouts);
        if let Some(dir) = &opts.working_dir {
            request = request.with_working_dir(dir);
        }
        request
    }
}

fn build_merge_prompt(
    original_prompt: &str,
    survivors: &[(usize, String)],
    strategy: Strategy,
) -> String {
    let rules = match strategy {
        Strategy::Converge => {
            "The candidates tackled a fact-style task and should mostly agree. Reconcile \
             them: where they agree, keep the majority answer; where detail differs, prefer \
             the most specific correct version; do not introduce claims absent from every \
             candidate."
        }
        Strategy::Diverge => {
            "The candidates represent different perspectives on an open-ended task. \
             Synthesize a higher-order answer: integrate the strongest elements of each, \
             resolve conflicts explicitly, and state the reasoning where candidates \
             disagree."
        }
    };

    let mut prompt = format!(
        "Merge the candidate answers below into one final answer.\n\n{rules}\n\n\
         # Original instructions\n\n{original_prompt}\n"
    );
    for (id, text) in survivors {
        prompt.push_str(&format!("\n# Candidate {id}\n\n{text}\n"));
    }
    prompt.push_str("\nReply with the final merged answer only.");
    prompt
}
