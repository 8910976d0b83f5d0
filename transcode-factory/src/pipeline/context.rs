//! Shared state of the pipeline, built once at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::finisher::Finisher;
use crate::database::JobRepository;
use crate::domain::{Job, JobDefinition, JobState, MediaMetadata, Stage};
use crate::encoder::Encoder;
use crate::hub::HubHandle;
use crate::{Error, Result};

/// Capacity of the pipeline event channel.
const EVENT_CAPACITY: usize = 1024;

/// A job entered a new state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineEvent {
    pub job_id: i64,
    pub stage: Stage,
    pub state: JobState,
}

/// Concurrent work units allowed per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    pub crop: usize,
    pub transcode: usize,
    pub copy: usize,
}

impl StageLimits {
    pub fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Crop => self.crop,
            Stage::Transcode => self.transcode,
            Stage::Copy => self.copy,
        }
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            crop: 2,
            transcode: 2,
            copy: 2,
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub limits: StageLimits,
    /// Sleep between polls when a stage finds no work.
    pub poll_interval: Duration,
    /// Directory for per-job encoder logs.
    pub log_directory: PathBuf,
}

/// Everything the dispatchers and workers share.
pub struct SchedulerContext {
    pub repo: Arc<dyn JobRepository>,
    pub encoder: Arc<dyn Encoder>,
    pub hub: HubHandle,
    pub finisher: Finisher,
    pub config: PipelineConfig,
    pub cancel: CancellationToken,
    wake: Notify,
    events: broadcast::Sender<PipelineEvent>,
}

impl SchedulerContext {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        encoder: Arc<dyn Encoder>,
        hub: HubHandle,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            finisher: Finisher::new(repo.clone(), hub.clone()),
            repo,
            encoder,
            hub,
            config,
            cancel,
            wake: Notify::new(),
            events,
        }
    }

    /// Subscribe to job state changes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Validate and queue one job.
    ///
    /// The job's `Submitted` event is emitted by the dispatcher that claims it.
    pub async fn submit(&self, definition: JobDefinition) -> Result<i64> {
        let definition = definition.validated()?;
        let id = self.repo.submit(&definition).await?;
        info!(job_id = id, source = %definition.source, codec = %definition.codec, "Job submitted");
        self.hub.request_refresh();
        self.wake_dispatchers();
        Ok(id)
    }

    /// Validate and queue several jobs atomically. Ids follow input order.
    pub async fn submit_many(&self, definitions: Vec<JobDefinition>) -> Result<Vec<i64>> {
        let definitions = definitions
            .into_iter()
            .map(JobDefinition::validated)
            .collect::<Result<Vec<_>>>()?;
        let ids = self.repo.submit_many(&definitions).await?;
        info!(count = ids.len(), "Jobs submitted");
        self.hub.request_refresh();
        self.wake_dispatchers();
        Ok(ids)
    }

    /// Wake idle dispatchers so new or handed-off work is picked up early.
    pub fn wake_dispatchers(&self) {
        self.wake.notify_waiters();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }

    /// Emit a state change without touching the store.
    pub fn publish(&self, job_id: i64, stage: Stage, state: JobState) {
        debug!(job_id, %stage, %state, "Job state changed");
        let _ = self.events.send(PipelineEvent {
            job_id,
            stage,
            state,
        });
        self.hub.request_refresh();
    }

    /// Move `job` to `next`, persisting the lease state.
    pub async fn transition(&self, job: &mut Job, stage: Stage, next: JobState) -> Result<()> {
        let next = job.state.advance(next)?;
        self.repo.set_active_state(job.id, next).await?;
        job.state = next;
        self.publish(job.id, stage, next);
        Ok(())
    }

    /// Cached metadata for `job`, probing the source on a cache miss.
    pub async fn ensure_metadata(&self, job: &Job) -> Result<MediaMetadata> {
        if let Some(metadata) = self.repo.get_metadata(job.id).await? {
            debug!(job_id = job.id, "Using cached source metadata");
            return Ok(metadata);
        }

        let metadata = self
            .encoder
            .probe_metadata(&job.definition.source, &self.cancel)
            .await?;
        self.repo.save_metadata(job.id, &metadata).await?;
        info!(
            job_id = job.id,
            codec = %metadata.codec,
            width = metadata.width,
            height = metadata.height,
            duration = %metadata.duration,
            "Probed source metadata"
        );
        Ok(metadata)
    }

    /// Create the destination directory and register a fresh encoder log.
    pub async fn prepare_output(&self, job: &Job) -> Result<PathBuf> {
        let destination = Path::new(&job.definition.destination);
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io_path("creating", parent, e))?;
        }

        let log_dir = &self.config.log_directory;
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|e| Error::io_path("creating", log_dir, e))?;

        let file_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("job{}", job.id));
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let log_path = log_dir.join(format!("{file_name}_{nanos}.log"));

        self.repo
            .register_log_file(job.id, &log_path.to_string_lossy())
            .await?;
        Ok(log_path)
    }

    /// Mark `job` failed and hand it to the finisher.
    pub async fn fail(&self, job: &mut Job, stage: Stage, reason: &Error) {
        warn!(job_id = job.id, %stage, "Job failed: {}", reason);
        self.finish(job, stage, None, JobState::Failed).await;
    }

    /// Mark `job` successful and hand it to the finisher.
    pub async fn succeed(&self, job: &mut Job, stage: Stage, command_trace: Vec<String>) {
        self.finish(job, stage, Some(command_trace), JobState::Success)
            .await;
    }

    async fn finish(
        &self,
        job: &mut Job,
        stage: Stage,
        command_trace: Option<Vec<String>>,
        final_state: JobState,
    ) {
        if let Err(e) = self.transition(job, stage, final_state).await {
            warn!(job_id = job.id, %stage, "Failed to record {} state: {}", final_state, e);
        }
        // Errors are logged by the finisher.
        let _ = self.finisher.finish(job, command_trace, final_state).await;
    }

    /// Leave `job` behind during shutdown. Its lease is cleared at next startup.
    pub async fn abandon(&self, job: &mut Job, stage: Stage) {
        info!(job_id = job.id, %stage, state = %job.state, "Abandoning job on shutdown");
        if let Err(e) = self.transition(job, stage, JobState::Cancelled).await {
            debug!(job_id = job.id, "Failed to record cancellation: {}", e);
        }
    }

    /// Drop the lease after a transient error so the job is picked up again.
    pub async fn release_after_error(&self, job: &Job, stage: Stage, reason: &Error) {
        warn!(job_id = job.id, %stage, "Releasing job after error: {}", reason);
        if let Err(e) = self.repo.release(job.id).await {
            warn!(job_id = job.id, %stage, "Failed to release job: {}", e);
        }
        self.hub.request_refresh();
    }
}
