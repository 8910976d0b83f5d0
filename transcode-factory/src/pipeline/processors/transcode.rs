//! Transcode and copy stages: run the encoder and finish the job.

use async_trait::async_trait;
use tracing::info;

use super::StageProcessor;
use crate::domain::{Job, JobState, Stage};
use crate::pipeline::SchedulerContext;

/// Runs the encoder for the transcode or the copy stage.
pub struct TranscodeProcessor {
    stage: Stage,
}

impl TranscodeProcessor {
    pub fn transcode() -> Self {
        Self {
            stage: Stage::Transcode,
        }
    }

    pub fn copy() -> Self {
        Self { stage: Stage::Copy }
    }
}

#[async_trait]
impl StageProcessor for TranscodeProcessor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn requires_metadata(&self) -> bool {
        true
    }

    async fn process(&self, ctx: &SchedulerContext, mut job: Job) {
        let stage = self.stage;

        if let Err(e) = ctx.transition(&mut job, stage, JobState::Transcoding).await {
            ctx.release_after_error(&job, stage, &e).await;
            return;
        }

        let log_path = match ctx.prepare_output(&job).await {
            Ok(path) => path,
            Err(e) => {
                ctx.fail(&mut job, stage, &e).await;
                return;
            }
        };

        info!(
            job_id = job.id,
            %stage,
            destination = %job.definition.destination,
            log = %log_path.display(),
            "Starting encoder"
        );

        match ctx
            .encoder
            .run_transcode(&job.definition, &log_path, &ctx.cancel)
            .await
        {
            Ok(command_trace) => ctx.succeed(&mut job, stage, command_trace).await,
            Err(e) if e.is_cancelled() => ctx.abandon(&mut job, stage).await,
            Err(e) => ctx.fail(&mut job, stage, &e).await,
        }
    }
}
