//! Fan-out: N independent lifecycle calls against one prompt.
//!
//! Each instance is told to write its answer to a uniquely numbered file
//! so the convergence pass can read survivors back. Every failed instance
//! is retried exactly once; every outcome is classified. Partial success
//! is expected — the caller decides sufficiency.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use shipwright_agent::{AgentBackend, AgentRequest, AgentResult, AgentStatus};
use shipwright_utils::types::TokenUsage;

/// Hard cap on fan-out width.
pub const MAX_FANOUT: usize = 10;

/// Outcome of one fan-out: per-instance results keyed by id (1..=N) plus
/// the id classification sets and aggregate usage. Created per call,
/// discarded after the caller reads it.
#[derive(Debug, Default)]
pub struct FanoutBatch {
    pub results: BTreeMap<usize, AgentResult>,
    pub done_ids: Vec<usize>,
    pub failed_ids: Vec<usize>,
    pub rate_limited_ids: Vec<usize>,
    pub timed_out_ids: Vec<usize>,
    pub usage: TokenUsage,
}

impl FanoutBatch {
    /// Final texts of the surviving (done) instances, in id order.
    #[must_use]
    pub fn survivor_texts(&self) -> Vec<(usize, &str)> {
        self.done_ids
            .iter()
            .filter_map(|id| self.results.get(id).map(|r| (*id, r.text())))
            .collect()
    }
}

/// The name of the output file instance `id` is told to write.
#[must_use]
pub fn output_file_name(id: usize) -> String {
    format!("fanout-{id}.md")
}

/// Runs N lifecycle manager calls concurrently and joins them.
pub struct FanoutRunner {
    agent: Arc<dyn AgentBackend>,
}

impl FanoutRunner {
    #[must_use]
    pub fn new(agent: Arc<dyn AgentBackend>) -> Self {
        Self { agent }
    }

    /// Spawn `count` independent invocations of `base` (clamped to
    /// [`MAX_FANOUT`]), retry each failure once, and classify every
    /// outcome.
    pub async fn run_parallel(&self, base: &AgentRequest, count: usize) -> FanoutBatch {
        let count = count.clamp(1, MAX_FANOUT);
        let mut set = JoinSet::new();

        for id in 1..=count {
            let agent = Arc::clone(&self.agent);
            let mut request = base.clone();
            request.prompt = format!(
                "{}\n\nWrite your complete answer to the file `{}` in the working directory before finishing.",
                base.prompt,
                output_file_name(id),
            );
            set.spawn(async move {
                let first = agent.invoke(&request).await;
                if first.is_done() {
                    return (id, first);
                }
                // One retry per failed instance, then the outcome stands.
                let mut second = agent.invoke(&request).await;
                second.token_usage.absorb(first.token_usage);
                (id, second)
            });
        }

        let mut batch = FanoutBatch::default();
        while let Some(joined) = set.join_next().await {
            let Ok((id, result)) = joined else {
                warn!("fan-out instance panicked; counting it as failed");
                continue;
            };
            batch.usage.absorb(result.token_usage);
            match result.status {
                AgentStatus::Done => batch.done_ids.push(id),
                AgentStatus::Failed => batch.failed_ids.push(id),
                AgentStatus::RateLimited => batch.rate_limited_ids.push(id),
                AgentStatus::Timeout => batch.timed_out_ids.push(id),
            }
            batch.results.insert(id, result);
        }

        batch.done_ids.sort_unstable();
        batch.failed_ids.sort_unstable();
        batch.rate_limited_ids.sort_unstable();
        batch.timed_out_ids.sort_unstable();
        batch
    }
}
