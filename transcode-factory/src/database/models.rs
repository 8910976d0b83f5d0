//! Row models for the factory schema.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{Job, JobDefinition, JobState, MediaMetadata};
use crate::Result;

/// Row of `transcode_queue`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedJobDbModel {
    pub id: i64,
    pub source: String,
    pub destination: String,
    /// JSON array of subtitle file paths
    pub srt_files: String,
    pub crf: i64,
    pub autocrop: bool,
    pub crop_complete: bool,
    pub video_filters: String,
    pub audio_filters: String,
    pub codec: String,
    /// RFC 3339 timestamp
    pub submitted_at: String,
}

impl QueuedJobDbModel {
    /// Rebuild the submitted definition. An unreadable subtitle list is
    /// logged and treated as empty.
    pub fn definition(&self) -> JobDefinition {
        let srt_files = if self.srt_files.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.srt_files).unwrap_or_else(|e| {
                tracing::warn!(job_id = self.id, "Failed to parse subtitle list: {}", e);
                Vec::new()
            })
        };
        JobDefinition {
            source: self.source.clone(),
            destination: self.destination.clone(),
            srt_files,
            crf: self.crf,
            autocrop: self.autocrop,
            video_filters: self.video_filters.clone(),
            audio_filters: self.audio_filters.clone(),
            codec: self.codec.clone(),
        }
    }

    pub fn into_job(self) -> Job {
        Job::new(self.id, self.definition(), self.crop_complete)
    }
}

/// Row of `source_metadata`.
#[derive(Debug, Clone, FromRow)]
pub struct SourceMetadataDbModel {
    pub id: i64,
    pub duration: String,
    pub codec: String,
    pub width: i64,
    pub height: i64,
}

impl From<SourceMetadataDbModel> for MediaMetadata {
    fn from(row: SourceMetadataDbModel) -> Self {
        Self {
            duration: row.duration,
            codec: row.codec,
            width: row.width,
            height: row.height,
        }
    }
}

/// Row of `completed_jobs`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CompletedJobDbModel {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub autocrop: bool,
    /// JSON array of encoder arguments, empty for failed jobs
    pub command_trace: String,
    pub status: String,
    pub completed_at: String,
}

impl CompletedJobDbModel {
    pub fn command_args(&self) -> Result<Vec<String>> {
        if self.command_trace.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&self.command_trace)?)
    }
}

/// A leased job joined with its queue row, for status views.
#[derive(Debug, Clone, FromRow)]
pub struct ActiveJobDbModel {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub codec: String,
    pub state: String,
    pub updated_at: String,
}

/// Row of `log_files`.
#[derive(Debug, Clone, FromRow)]
pub struct LogFileDbModel {
    pub id: i64,
    pub path: String,
}

/// Status view of a leased job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobView {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub codec: String,
    pub state: Option<JobState>,
    pub state_label: String,
    pub updated_at: String,
}

impl From<ActiveJobDbModel> for ActiveJobView {
    fn from(row: ActiveJobDbModel) -> Self {
        let state = JobState::parse(&row.state);
        let state_label = state
            .map(|s| s.label().to_string())
            .unwrap_or_else(|| row.state.clone());
        Self {
            id: row.id,
            source: row.source,
            destination: row.destination,
            codec: row.codec,
            state,
            state_label,
            updated_at: row.updated_at,
        }
    }
}

/// Status view of a job waiting for pickup.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedJobView {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub codec: String,
    pub autocrop: bool,
    pub crop_complete: bool,
}

impl From<QueuedJobDbModel> for QueuedJobView {
    fn from(row: QueuedJobDbModel) -> Self {
        Self {
            id: row.id,
            source: row.source,
            destination: row.destination,
            codec: row.codec,
            autocrop: row.autocrop,
            crop_complete: row.crop_complete,
        }
    }
}

/// Snapshot returned by the status query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub active: Vec<ActiveJobView>,
    pub queued: Vec<QueuedJobView>,
}
