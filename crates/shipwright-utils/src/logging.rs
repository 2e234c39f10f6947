//! Tracing setup for the shipwright workspace.
//!
//! Structured logging goes through `tracing`; per-task agent transcripts are
//! handled separately by the lifecycle manager's log tee. This module only
//! owns subscriber initialization and the common span helpers.

use tracing::{Level, info, span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Initialize the tracing subscriber.
///
/// Respects `RUST_LOG` when set; otherwise defaults to `shipwright=info`
/// (or `shipwright=debug` in verbose mode). Verbose mode also emits span
/// close events so stage durations show up without extra instrumentation.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("shipwright=debug,info")
            } else {
                EnvFilter::try_new("shipwright=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = fmt::layer()
        .with_target(verbose)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .compact();

    if verbose {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.with_span_events(FmtSpan::CLOSE))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()?;
    }

    Ok(())
}

/// Create a span covering one stage execution.
#[must_use]
pub fn stage_span(task_id: &str, stage: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "stage_execution",
        task_id = %task_id,
        stage = %stage,
    )
}

/// Log completion of a stage with its outcome and duration.
pub fn log_stage_complete(task_id: &str, stage: &str, status: &str, duration_ms: u128) {
    info!(
        task_id = %task_id,
        stage = %stage,
        status = %status,
        duration_ms = %duration_ms,
        "Stage complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_span_carries_fields() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let span = stage_span("task-7", "implement");
            assert_eq!(span.metadata().map(|m| m.name()), Some("stage_execution"));
        });
    }
}
