//! Rule application job status endpoints.
//!
//! Provides:
//! - GET /api/rule-jobs?limit= - Recent jobs, newest first
//! - GET /api/rule-jobs/{id} - One job's progress snapshot

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use triage_core::jobs::JobRecordError;

use super::ApiError;
use crate::AppState;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub limit: Option<u32>,
}

/// GET /api/rule-jobs
async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match state.service.jobs().list_recent(limit).await {
        Ok(jobs) => (StatusCode::OK, Json(jobs)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to list rule jobs");
            ApiError::internal("Failed to list rule jobs")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/rule-jobs/{id}
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.service.jobs().get_by_id(&id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(JobRecordError::JobNotFound(_)) => {
            ApiError::not_found(format!("Rule job not found: {id}"))
                .into_response_with(StatusCode::NOT_FOUND)
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "failed to get rule job");
            ApiError::internal("Failed to get rule job")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
