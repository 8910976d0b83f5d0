//! Job submission and audit routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::CompletedJobDbModel;
use crate::domain::JobDefinition;

/// Default page size of `/completed`.
const DEFAULT_COMPLETED_LIMIT: i64 = 50;

/// Largest page size accepted by `/completed`.
const MAX_COMPLETED_LIMIT: i64 = 1000;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkSubmitResponse {
    pub ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompletedQuery {
    pub limit: Option<i64>,
}

impl CompletedQuery {
    fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_COMPLETED_LIMIT)
            .clamp(1, MAX_COMPLETED_LIMIT)
    }
}

/// One audit row as returned by `/completed`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompletedJobResponse {
    pub id: i64,
    pub source: String,
    pub destination: String,
    pub autocrop: bool,
    pub command: Vec<String>,
    pub status: String,
    pub completed_at: String,
}

impl From<CompletedJobDbModel> for CompletedJobResponse {
    fn from(row: CompletedJobDbModel) -> Self {
        let command = row.command_args().unwrap_or_else(|e| {
            tracing::warn!(job_id = row.id, "Unreadable command trace: {}", e);
            Vec::new()
        });
        Self {
            id: row.id,
            source: row.source,
            destination: row.destination,
            autocrop: row.autocrop,
            command,
            status: row.status,
            completed_at: row.completed_at,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/add", post(add_job))
        .route("/bulkadd", post(bulk_add_jobs))
        .route("/completed", get(list_completed))
        .route("/completed/{id}", get(get_completed))
}

async fn add_job(
    State(state): State<AppState>,
    payload: Result<Json<JobDefinition>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(definition) = payload?;
    let id = state.ctx.submit(definition).await?;
    Ok(Json(SubmitResponse { id }))
}

async fn bulk_add_jobs(
    State(state): State<AppState>,
    payload: Result<Json<Vec<JobDefinition>>, JsonRejection>,
) -> ApiResult<Json<BulkSubmitResponse>> {
    let Json(definitions) = payload?;
    if definitions.is_empty() {
        return Err(ApiError::bad_request("no jobs submitted"));
    }
    let ids = state.ctx.submit_many(definitions).await?;
    Ok(Json(BulkSubmitResponse { ids }))
}

async fn list_completed(
    State(state): State<AppState>,
    Query(query): Query<CompletedQuery>,
) -> ApiResult<Json<Vec<CompletedJobResponse>>> {
    let rows = state
        .ctx
        .repo
        .list_completed(query.effective_limit())
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn get_completed(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<CompletedJobResponse>> {
    let row = state
        .ctx
        .repo
        .get_completed(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No completed job with id {id}")))?;
    Ok(Json(row.into()))
}
