//! Job pipeline: stage dispatchers, their workers and the finisher.

mod context;
mod dispatcher;
mod finisher;
pub mod processors;

pub use context::{PipelineConfig, PipelineEvent, SchedulerContext, StageLimits};
pub use dispatcher::StageDispatcher;
pub use finisher::Finisher;

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::Result;
use processors::{CropProcessor, StageProcessor, TranscodeProcessor};

/// The three running stage dispatchers.
pub struct Pipeline {
    dispatchers: JoinSet<()>,
}

impl Pipeline {
    /// Clear leases left by a previous run, then start every dispatcher.
    ///
    /// Queue rows are authoritative: a job abandoned mid-stage is picked up
    /// again from the start of that stage.
    pub async fn start(ctx: Arc<SchedulerContext>) -> Result<Self> {
        let stale = ctx.repo.clear_active_leases().await?;
        if stale > 0 {
            warn!(stale, "Cleared leases left by a previous run");
        }

        let processors: [Arc<dyn StageProcessor>; 3] = [
            Arc::new(CropProcessor),
            Arc::new(TranscodeProcessor::transcode()),
            Arc::new(TranscodeProcessor::copy()),
        ];

        let mut dispatchers = JoinSet::new();
        for processor in processors {
            dispatchers.spawn(StageDispatcher::new(ctx.clone(), processor).run());
        }
        info!("Pipeline started");

        Ok(Self { dispatchers })
    }

    /// Wait for every dispatcher to stop after cancellation.
    pub async fn join(mut self) {
        while let Some(result) = self.dispatchers.join_next().await {
            if let Err(e) = result {
                warn!("Stage dispatcher ended abnormally: {}", e);
            }
        }
        info!("Pipeline stopped");
    }
}
