//! The delivery engine: fan-out/convergence, stage modules, and the
//! pipeline/gate state machine.
//!
//! Layering, leaves first: the lifecycle manager lives in
//! `shipwright-agent`; [`fanout`] runs N lifecycle calls concurrently and
//! classifies the outcomes; [`converge`] merges survivors back into one
//! answer; [`stages`] are the nine interchangeable pipeline units; and
//! [`pipeline`] assembles them into one of the four named pipelines under
//! the artifact-dependency contract.

pub mod converge;
pub mod fanout;
pub mod pipeline;
pub mod ports;
pub mod stage;
pub mod stages;
pub mod testing;
pub mod waves;

pub use converge::{Classification, Complexity, ConvergeOptions, ConvergeRunner, MergedOutput, Strategy};
pub use fanout::{FanoutBatch, FanoutRunner, MAX_FANOUT};
pub use pipeline::{PipelineEngine, StageOutcome, TaskRun, TaskStatus};
pub use ports::{ArtifactStore, FsArtifactStore, KnowledgeEntry, KnowledgeStore, MergeOutcome};
pub use stage::{Stage, StageContext, StageResult, StageStatus, Subtask, TaskSpec, TaskState};
