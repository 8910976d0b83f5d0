//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::routes;
use crate::error::{Error, Result};
use crate::pipeline::SchedulerContext;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SchedulerContext>,
}

impl AppState {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }
}

/// Build the router with all middleware and routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server.
pub struct ApiServer {
    addr: SocketAddr,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            addr,
            state,
            cancel_token,
        }
    }

    /// Serve until the cancellation token fires, then drain open requests.
    pub async fn run(self) -> Result<()> {
        let router = build_router(self.state);
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::ApiError(format!("Failed to bind {}: {}", self.addr, e)))?;

        tracing::info!("API server listening on http://{}", self.addr);

        let cancel_token = self.cancel_token;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| Error::ApiError(format!("Server error: {}", e)))?;

        Ok(())
    }
}
