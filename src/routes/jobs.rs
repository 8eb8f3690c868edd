use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tracing::info;

use crate::models::{
    AppState, CancelRequest, CancelResponse, JobKind, JobStatus, JobStatusResponse,
    StatusQuery, SubmitResponse,
};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs/cancel", post(cancel_job))
        .route("/jobs/status", get(job_status))
        .route("/jobs/{kind}", post(submit_job))
        .with_state(state)
}

fn require_id(id: Option<String>) -> AppResult<String> {
    match id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(AppError::InvalidRequest("id is required".to_string())),
    }
}

/// POST /jobs/{kind} - validate, persist and enqueue
async fn submit_job(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let kind = JobKind::from_id(&kind)
        .ok_or_else(|| AppError::InvalidRequest(format!("unknown job kind: {}", kind)))?;
    let Json(payload) = body.map_err(|e| AppError::InvalidRequest(e.body_text()))?;

    let id = state.jobs.submit_raw(kind, payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id,
            status: JobStatus::Queued,
        }),
    ))
}

/// POST /jobs/cancel
async fn cancel_job(
    State(state): State<AppState>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> AppResult<Json<CancelResponse>> {
    let Json(request) = body.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    let id = require_id(request.id)?;

    let outcome = state.jobs.cancel(&id).await?;
    info!(job_id = %id, ?outcome, "Cancel request handled");

    Ok(Json(CancelResponse {
        status: JobStatus::Cancelled,
    }))
}

/// GET /jobs/status?id=
async fn job_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<JobStatusResponse>> {
    let id = require_id(query.id)?;
    Ok(Json(state.jobs.status(&id).await?))
}
