//! Crop stage: detect black borders and fold a crop into the video filter.

use async_trait::async_trait;
use tracing::{info, warn};

use super::StageProcessor;
use crate::domain::{Job, JobState, MediaMetadata, Stage};
use crate::pipeline::SchedulerContext;

/// Prepend `crop` to `existing` if it changes the frame size.
///
/// An unknown source size (no metadata, or zero dimensions) always takes the
/// crop. An unparseable dimension counts as 0.
pub fn compose_video_filter(crop: &str, existing: &str, source: Option<&MediaMetadata>) -> String {
    if crop.is_empty() {
        return existing.to_string();
    }

    let mut dims = crop
        .trim_start_matches("crop=")
        .split(':')
        .map(|d| d.parse::<i64>().unwrap_or(0));
    let width = dims.next().unwrap_or(0);
    let height = dims.next().unwrap_or(0);

    let changes_size = match source {
        Some(meta) if meta.width > 0 && meta.height > 0 => {
            width != meta.width || height != meta.height
        }
        _ => true,
    };

    if !changes_size {
        existing.to_string()
    } else if existing.is_empty() {
        crop.to_string()
    } else {
        format!("{crop},{existing}")
    }
}

/// Runs crop detection and hands the job to the transcode stage.
pub struct CropProcessor;

#[async_trait]
impl StageProcessor for CropProcessor {
    fn stage(&self) -> Stage {
        Stage::Crop
    }

    fn requires_metadata(&self) -> bool {
        false
    }

    async fn process(&self, ctx: &SchedulerContext, mut job: Job) {
        let stage = self.stage();
        let source = job.definition.source.clone();

        let crop = match ctx.encoder.detect_crop(&source, &ctx.cancel).await {
            Ok(crop) => crop,
            Err(e) if e.is_cancelled() => {
                ctx.abandon(&mut job, stage).await;
                return;
            }
            Err(e) => {
                warn!(job_id = job.id, "Crop detection failed, continuing without crop: {}", e);
                String::new()
            }
        };

        let filters =
            compose_video_filter(&crop, &job.definition.video_filters, job.metadata.as_ref());

        let next = match job.state.advance(JobState::PendingTranscode) {
            Ok(next) => next,
            Err(e) => {
                ctx.release_after_error(&job, stage, &e).await;
                return;
            }
        };

        // Writes the filter, sets crop_complete and drops the lease together.
        if let Err(e) = ctx.repo.complete_crop(job.id, &filters).await {
            ctx.release_after_error(&job, stage, &e).await;
            return;
        }

        info!(job_id = job.id, video_filters = %filters, "Crop stage complete");
        job.state = next;
        ctx.publish(job.id, stage, next);
        ctx.wake_dispatchers();
    }
}
