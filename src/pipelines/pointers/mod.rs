//! The pointer pipeline and its support types.
pub mod events;
pub mod pipeline;
pub mod state;

pub use events::{EventLog, ProgressEvent, Stage};
pub use pipeline::{sort_one_shard, PipelineReport, PointerPipeline, ShardSortOutcome};
pub use state::{ShardPlan, ShardState};
