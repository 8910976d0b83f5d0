//! Work run by each stage once a job holds a slot.

mod crop;
mod transcode;

pub use crop::{CropProcessor, compose_video_filter};
pub use transcode::TranscodeProcessor;

use async_trait::async_trait;

use crate::domain::{Job, Stage};
use crate::pipeline::SchedulerContext;

/// Work unit of one stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// The stage this processor serves.
    fn stage(&self) -> Stage;

    /// Whether a failed probe fails the job. When `false` the job continues
    /// without source metadata.
    fn requires_metadata(&self) -> bool;

    /// Run the stage's work for `job`, which holds a slot and a lease.
    ///
    /// Must leave the job finished, handed off, released or abandoned.
    async fn process(&self, ctx: &SchedulerContext, job: Job);
}
