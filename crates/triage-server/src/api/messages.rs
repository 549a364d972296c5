//! Single-message classification.
//!
//! Provides:
//! - POST /api/messages/{id}/classify - Pick the winning rule, optionally applying it

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde::{Deserialize, Serialize};

use triage_core::rules::RuleMatch;

use super::service_error_response;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}/classify", post(classify_message))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyRequest {
    #[serde(default)]
    pub apply: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyResponse {
    pub message_id: i64,
    /// `None` when no enabled rule matched.
    pub matched: Option<RuleMatch>,
    pub applied: bool,
}

/// POST /api/messages/{id}/classify
async fn classify_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ClassifyRequest>,
) -> impl IntoResponse {
    match state.service.classify_message(id, body.apply).await {
        Ok(matched) => {
            let applied = body.apply && matched.is_some();
            (
                StatusCode::OK,
                Json(ClassifyResponse {
                    message_id: id,
                    matched,
                    applied,
                }),
            )
                .into_response()
        }
        Err(e) => service_error_response(e, "classify message"),
    }
}
