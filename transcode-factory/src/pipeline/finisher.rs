//! Pipeline finisher: moves a job from the queue into the audit log.

use std::sync::Arc;

use tracing::{error, info};

use crate::database::JobRepository;
use crate::database::repositories::CompletionRecord;
use crate::domain::{Job, JobState};
use crate::hub::HubHandle;
use crate::{Error, Result};

/// Writes the audit row and drops the job's transient rows in one transaction.
#[derive(Clone)]
pub struct Finisher {
    repo: Arc<dyn JobRepository>,
    hub: HubHandle,
}

impl Finisher {
    pub fn new(repo: Arc<dyn JobRepository>, hub: HubHandle) -> Self {
        Self { repo, hub }
    }

    /// Record `job` as finished with `final_state`.
    ///
    /// `command_trace` is the encoder argument list for successful jobs and
    /// `None` for failures. Finishing an already finished job is a no-op.
    /// When the commit fails the job keeps its lease and prior rows.
    pub async fn finish(
        &self,
        job: &Job,
        command_trace: Option<Vec<String>>,
        final_state: JobState,
    ) -> Result<()> {
        if !matches!(final_state, JobState::Success | JobState::Failed) {
            return Err(Error::validation(format!(
                "job {} cannot finish in non-terminal state {}",
                job.id, final_state
            )));
        }

        let record = CompletionRecord {
            source: job.definition.source.clone(),
            destination: job.definition.destination.clone(),
            autocrop: job.definition.autocrop,
            command_trace,
            status: final_state,
        };

        match self.repo.finish(job.id, &record).await {
            Ok(true) => {
                info!(job_id = job.id, state = %final_state, "Job finished");
            }
            Ok(false) => {
                info!(job_id = job.id, "Job was already finished");
            }
            Err(e) => {
                error!(
                    alert = true,
                    job_id = job.id,
                    state = %final_state,
                    "Failed to finish job, it stays leased until restart: {}",
                    e
                );
                return Err(e);
            }
        }

        self.hub.request_refresh();
        Ok(())
    }
}
