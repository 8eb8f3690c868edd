use axum::{extract::State, routing::get, Json, Router};

use crate::db::JobStore;
use crate::models::{AppState, HealthResponse};
use crate::queue::JobQueue;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.jobs.store().ping().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };
    let queue = match state.jobs.queue().ping().await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };
    let status = if database == "connected" && queue == "connected" {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        database: database.to_string(),
        queue: queue.to_string(),
    })
}
