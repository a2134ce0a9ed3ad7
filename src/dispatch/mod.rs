//! Campaign dispatch: campaign lookup, the send loop, checkpoints, and statistics.

mod campaign;
mod checkpoint;
mod dispatcher;
mod stats;

pub use campaign::{Campaign, CampaignSource, InMemoryCampaignSource};
pub use checkpoint::{CheckpointStore, DispatchCursor, FileCheckpointStore, InMemoryCheckpointStore};
pub use dispatcher::{CampaignDispatcher, DispatchOptions, ThrottlePolicy};
pub use stats::{
    DispatchResult, DispatchStatus, InMemoryStatisticsSink, LogStatisticsSink, StatisticsSink,
};
