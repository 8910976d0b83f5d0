//! Job repository.
//!
//! Every read-then-write runs inside a `BEGIN IMMEDIATE` transaction on the
//! write pool; plain reads use the read pool.

use async_trait::async_trait;

use crate::database::models::{
    ActiveJobDbModel, CompletedJobDbModel, LogFileDbModel, QueuedJobDbModel,
    SourceMetadataDbModel, StatusSnapshot,
};
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::domain::{JobDefinition, JobState, MediaMetadata, Stage};
use crate::{Error, Result};

/// Audit record written when a job leaves the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub source: String,
    pub destination: String,
    pub autocrop: bool,
    /// Encoder arguments, `None` for failed jobs.
    pub command_trace: Option<Vec<String>>,
    pub status: JobState,
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    // Submission
    async fn submit(&self, definition: &JobDefinition) -> Result<i64>;
    async fn submit_many(&self, definitions: &[JobDefinition]) -> Result<Vec<i64>>;
    async fn get_queued(&self, id: i64) -> Result<QueuedJobDbModel>;

    // Leases
    /// Take the lowest-id job eligible for `stage` that nobody holds, leasing
    /// it in `state`.
    async fn claim_next(&self, stage: Stage, state: JobState) -> Result<Option<QueuedJobDbModel>>;
    async fn set_active_state(&self, id: i64, state: JobState) -> Result<()>;
    async fn release(&self, id: i64) -> Result<()>;
    /// Drop every lease and log registration. Returns the number of leases removed.
    async fn clear_active_leases(&self) -> Result<u64>;

    // Metadata cache
    async fn get_metadata(&self, id: i64) -> Result<Option<MediaMetadata>>;
    /// Cache probe results; an existing entry is kept.
    async fn save_metadata(&self, id: i64, metadata: &MediaMetadata) -> Result<()>;

    // Crop stage
    /// Store the composed video filter, mark cropping done and release the lease.
    async fn complete_crop(&self, id: i64, video_filters: &str) -> Result<()>;

    // Encoder logs
    async fn register_log_file(&self, id: i64, path: &str) -> Result<()>;
    async fn active_log_files(&self) -> Result<Vec<LogFileDbModel>>;

    // Completion
    /// Move a job to the audit log and drop all its transient rows.
    ///
    /// Returns `false` when the job had already been finished.
    async fn finish(&self, id: i64, record: &CompletionRecord) -> Result<bool>;
    async fn get_completed(&self, id: i64) -> Result<Option<CompletedJobDbModel>>;
    async fn list_completed(&self, limit: i64) -> Result<Vec<CompletedJobDbModel>>;

    // Views
    async fn status(&self) -> Result<StatusSnapshot>;
}

/// SQLx implementation of JobRepository.
#[derive(Clone)]
pub struct SqlxJobRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxJobRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn insert_definition(
    conn: &mut sqlx::SqliteConnection,
    definition: &JobDefinition,
    submitted_at: &str,
) -> Result<i64> {
    let srt_files = serde_json::to_string(&definition.srt_files)?;
    let result = sqlx::query(
        r#"
        INSERT INTO transcode_queue
            (source, destination, srt_files, crf, autocrop, crop_complete,
             video_filters, audio_filters, codec, submitted_at)
        VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&definition.source)
    .bind(&definition.destination)
    .bind(&srt_files)
    .bind(definition.crf)
    .bind(definition.autocrop)
    .bind(&definition.video_filters)
    .bind(&definition.audio_filters)
    .bind(&definition.codec)
    .bind(submitted_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn submit(&self, definition: &JobDefinition) -> Result<i64> {
        let mut conn = self.write_pool.acquire().await?;
        insert_definition(&mut conn, definition, &now()).await
    }

    async fn submit_many(&self, definitions: &[JobDefinition]) -> Result<Vec<i64>> {
        let submitted_at = now();
        let mut tx = begin_immediate(&self.write_pool).await?;
        let mut ids = Vec::with_capacity(definitions.len());
        for definition in definitions {
            ids.push(insert_definition(&mut tx, definition, &submitted_at).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn get_queued(&self, id: i64) -> Result<QueuedJobDbModel> {
        sqlx::query_as::<_, QueuedJobDbModel>("SELECT * FROM transcode_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id.to_string()))
    }

    async fn claim_next(&self, stage: Stage, state: JobState) -> Result<Option<QueuedJobDbModel>> {
        let query = format!(
            "SELECT * FROM transcode_queue WHERE {} AND id NOT IN (SELECT id FROM active_jobs) ORDER BY id LIMIT 1",
            stage.eligibility_predicate()
        );

        let mut tx = begin_immediate(&self.write_pool).await?;
        let row = sqlx::query_as::<_, QueuedJobDbModel>(&query)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(job) = &row {
            sqlx::query("INSERT INTO active_jobs (id, state, updated_at) VALUES (?, ?, ?)")
                .bind(job.id)
                .bind(state.as_str())
                .bind(now())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_active_state(&self, id: i64, state: JobState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_jobs (id, state, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .bind(now())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn release(&self, id: i64) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        sqlx::query("DELETE FROM log_files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM active_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_active_leases(&self) -> Result<u64> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        sqlx::query("DELETE FROM log_files")
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM active_jobs")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    async fn get_metadata(&self, id: i64) -> Result<Option<MediaMetadata>> {
        let row = sqlx::query_as::<_, SourceMetadataDbModel>(
            "SELECT * FROM source_metadata WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MediaMetadata::from))
    }

    async fn save_metadata(&self, id: i64, metadata: &MediaMetadata) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO source_metadata (id, duration, codec, width, height) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&metadata.duration)
        .bind(&metadata.codec)
        .bind(metadata.width)
        .bind(metadata.height)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn complete_crop(&self, id: i64, video_filters: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        let updated = sqlx::query(
            "UPDATE transcode_queue SET video_filters = ?, crop_complete = 1 WHERE id = ?",
        )
        .bind(video_filters)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Err(Error::not_found("Job", id.to_string()));
        }
        sqlx::query("DELETE FROM active_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn register_log_file(&self, id: i64, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO log_files (id, path) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET path = excluded.path",
        )
        .bind(id)
        .bind(path)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn active_log_files(&self) -> Result<Vec<LogFileDbModel>> {
        let rows = sqlx::query_as::<_, LogFileDbModel>(
            r#"
            SELECT log_files.id, log_files.path FROM log_files
            INNER JOIN active_jobs ON active_jobs.id = log_files.id
            ORDER BY log_files.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn finish(&self, id: i64, record: &CompletionRecord) -> Result<bool> {
        let command_trace = match &record.command_trace {
            Some(args) => serde_json::to_string(args)?,
            None => String::new(),
        };

        let mut tx = begin_immediate(&self.write_pool).await?;
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO completed_jobs
                (id, source, destination, autocrop, command_trace, status, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&record.source)
        .bind(&record.destination)
        .bind(record.autocrop)
        .bind(&command_trace)
        .bind(record.status.as_str())
        .bind(now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Children first, the queue row holds the foreign keys.
        for table in ["log_files", "active_jobs", "source_metadata", "transcode_queue"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(inserted > 0)
    }

    async fn get_completed(&self, id: i64) -> Result<Option<CompletedJobDbModel>> {
        let row = sqlx::query_as::<_, CompletedJobDbModel>(
            "SELECT * FROM completed_jobs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_completed(&self, limit: i64) -> Result<Vec<CompletedJobDbModel>> {
        let rows = sqlx::query_as::<_, CompletedJobDbModel>(
            "SELECT * FROM completed_jobs ORDER BY completed_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn status(&self) -> Result<StatusSnapshot> {
        // One read transaction so both lists come from the same snapshot.
        let mut tx = self.pool.begin().await?;

        let active = sqlx::query_as::<_, ActiveJobDbModel>(
            r#"
            SELECT q.id, q.source, q.destination, q.codec, a.state, a.updated_at
            FROM active_jobs a
            INNER JOIN transcode_queue q ON q.id = a.id
            ORDER BY q.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let queued = sqlx::query_as::<_, QueuedJobDbModel>(
            "SELECT * FROM transcode_queue WHERE id NOT IN (SELECT id FROM active_jobs) ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StatusSnapshot {
            active: active.into_iter().map(Into::into).collect(),
            queued: queued.into_iter().map(Into::into).collect(),
        })
    }
}
