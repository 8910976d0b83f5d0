//! Pipeline status routes.

use axum::{
    Json, Router,
    extract::State,
    response::Redirect,
    routing::get,
};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::database::models::StatusSnapshot;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
}

async fn index() -> Redirect {
    Redirect::to("/status")
}

/// Leased jobs with their live state, then jobs waiting for pickup.
async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusSnapshot>> {
    Ok(Json(state.ctx.repo.status().await?))
}
