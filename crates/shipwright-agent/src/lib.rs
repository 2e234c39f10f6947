//! Process lifecycle manager for coding-agent CLI invocations.
//!
//! One call to [`AgentBackend::invoke`] owns one subprocess and everything
//! attached to it: the locked-down environment, the stdin prompt write, the
//! incremental stdout/stderr pump, up to three timers (single, idle, hard),
//! and the two-phase process-group kill that guarantees nothing outlives
//! the call. Every failure mode is encoded in the returned
//! [`AgentResult::status`]; `invoke` never raises.

mod command;
mod env;
mod invoke;
mod logger;
mod stream;
mod types;

pub use invoke::CliAgent;
pub use stream::{AgentEvent, StreamParser};
pub use types::{
    AgentBackend, AgentRequest, AgentResult, AgentStatus, LogTargets, TimeoutKind, Timeouts,
};
