//! Stage dispatcher: one polling loop per stage feeding a bounded worker set.
//!
//! The loop itself is sequential. It claims the oldest eligible job, probes
//! it, waits for a free slot and hands the job to a worker. Only workers run
//! concurrently, at most `limit` at a time.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::SchedulerContext;
use super::processors::StageProcessor;
use crate::Error;
use crate::domain::{Job, JobState, Stage};

/// Polling loop of one stage.
pub struct StageDispatcher {
    ctx: Arc<SchedulerContext>,
    processor: Arc<dyn StageProcessor>,
    limit: usize,
}

impl StageDispatcher {
    pub fn new(ctx: Arc<SchedulerContext>, processor: Arc<dyn StageProcessor>) -> Self {
        let limit = ctx.config.limits.for_stage(processor.stage()).max(1);
        Self {
            ctx,
            processor,
            limit,
        }
    }

    pub fn stage(&self) -> Stage {
        self.processor.stage()
    }

    /// Run until the context's token is cancelled, then wait for in-flight workers.
    pub async fn run(self) {
        let stage = self.stage();
        let cancel = self.ctx.cancel.clone();
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut workers = JoinSet::new();

        info!(%stage, limit = self.limit, "Stage dispatcher started");

        loop {
            while let Some(result) = workers.try_join_next() {
                if let Err(e) = result {
                    error!(%stage, "Stage worker panicked: {}", e);
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let row = match self.ctx.repo.claim_next(stage, JobState::Submitted).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    self.idle().await;
                    continue;
                }
                Err(e) => {
                    warn!(%stage, "Failed to poll for the next job: {}", e);
                    self.idle().await;
                    continue;
                }
            };

            let Some(mut job) = self.prepare(row.into_job()).await else {
                continue;
            };

            // The job waits here, visibly pending, until a slot frees up.
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    self.ctx.abandon(&mut job, stage).await;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let ctx = self.ctx.clone();
            let processor = self.processor.clone();
            workers.spawn(async move {
                processor.process(&ctx, job).await;
                drop(permit);
            });
        }

        if !workers.is_empty() {
            info!(%stage, in_flight = workers.len(), "Waiting for stage workers to stop");
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(%stage, "Stage worker panicked: {}", e);
            }
        }
        info!(%stage, "Stage dispatcher stopped");
    }

    /// Walk a freshly claimed job up to the state it waits for a slot in.
    ///
    /// Returns `None` when the job failed, was released or was abandoned.
    async fn prepare(&self, mut job: Job) -> Option<Job> {
        let stage = self.stage();
        debug!(job_id = job.id, %stage, "Claimed job");
        self.ctx.publish(job.id, stage, job.state);

        if let Err(e) = self
            .ctx
            .transition(&mut job, stage, JobState::ProbingMetadata)
            .await
        {
            self.ctx.release_after_error(&job, stage, &e).await;
            return None;
        }

        match self.ctx.ensure_metadata(&job).await {
            Ok(metadata) => job.metadata = Some(metadata),
            Err(e) if e.is_cancelled() => {
                self.ctx.abandon(&mut job, stage).await;
                return None;
            }
            Err(e @ Error::DatabaseSqlx(_)) => {
                self.ctx.release_after_error(&job, stage, &e).await;
                return None;
            }
            Err(e) if self.processor.requires_metadata() => {
                self.ctx.fail(&mut job, stage, &e).await;
                return None;
            }
            Err(e) => {
                warn!(job_id = job.id, %stage, "Probe failed, continuing without source metadata: {}", e);
            }
        }

        let next = JobState::after_probe(
            job.definition.autocrop,
            job.crop_complete,
            &job.definition.codec,
        );
        if let Err(e) = self.ctx.transition(&mut job, stage, next).await {
            self.ctx.release_after_error(&job, stage, &e).await;
            return None;
        }
        Some(job)
    }

    /// Sleep until the poll interval passes, new work arrives or shutdown.
    async fn idle(&self) {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => {}
            _ = self.ctx.woken() => {}
            _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
        }
    }
}
