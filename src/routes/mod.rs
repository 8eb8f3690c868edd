//! API Routes
//!
//! - `POST /jobs/{kind}` - submit a `message` or `tool` job
//! - `POST /jobs/cancel` - request cancellation of a job
//! - `GET /jobs/status?id=` - current status and output
//! - `GET /api/health` - store and queue connectivity

pub mod health;
pub mod jobs;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(jobs::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
