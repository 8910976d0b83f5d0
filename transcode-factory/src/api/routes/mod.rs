//! API route modules.

pub mod jobs;
pub mod logstream;
pub mod status;

use axum::Router;

use crate::api::server::AppState;

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(jobs::router())
        .merge(status::router())
        .merge(logstream::router())
        .with_state(state)
}
