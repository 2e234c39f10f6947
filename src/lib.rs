//! shipwright — drives a coding-agent CLI through a staged
//! software-delivery pipeline.
//!
//! The workspace splits along the system's four layers plus ambient
//! concerns:
//!
//! - [`agent`] — process lifecycle manager: one subprocess per
//!   invocation, idle/hard/single timeouts, two-phase process-group kill,
//!   incremental stream-json parsing.
//! - [`engine`] — fan-out/convergence, the nine stage modules, and the
//!   pipeline/gate state machine.
//! - [`config`] — configuration resolved once from defaults, an optional
//!   TOML file, and environment overrides.
//! - [`redaction`] — secret scrubbing applied to transcripts and
//!   sanitized content.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shipwright::{CliAgent, Config, FsArtifactStore, PipelineEngine, TaskSpec};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::resolve()?.clone());
//! let agent = Arc::new(CliAgent::from_config(&config));
//! let store = Arc::new(FsArtifactStore::new(".shipwright/artifacts"));
//!
//! let engine = PipelineEngine::new(agent, store, None, config);
//! let run = engine
//!     .run_task(TaskSpec::new("task-42", "add retry logic to the fetcher", "medium"))
//!     .await;
//! println!("task ended {}", run.status.as_str());
//! # Ok(())
//! # }
//! ```

pub use shipwright_agent as agent;
pub use shipwright_config as config;
pub use shipwright_engine as engine;
pub use shipwright_redaction as redaction;
pub use shipwright_utils as utils;

pub use shipwright_agent::{
    AgentBackend, AgentRequest, AgentResult, AgentStatus, CliAgent, LogTargets, TimeoutKind,
    Timeouts,
};
pub use shipwright_config::Config;
pub use shipwright_engine::{
    ArtifactStore, ConvergeOptions, ConvergeRunner, FanoutBatch, FanoutRunner, FsArtifactStore,
    KnowledgeStore, PipelineEngine, StageResult, StageStatus, TaskRun, TaskSpec, TaskStatus,
};
pub use shipwright_redaction::SecretRedactor;
pub use shipwright_utils::error::ShipwrightError;
pub use shipwright_utils::logging::init_tracing;
pub use shipwright_utils::types::{OutputMode, Provider, StageId, TokenUsage};
