//! Domain types: job definitions, the lifecycle state machine and stage routing.

pub mod job;
pub mod stage;
pub mod state;

pub use job::{COPY_CODEC, DEFAULT_CODEC, DEFAULT_CRF, Job, JobDefinition, MediaMetadata};
pub use stage::Stage;
pub use state::JobState;
