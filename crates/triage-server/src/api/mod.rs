//! HTTP API handlers for rule management and application.

pub mod jobs;
pub mod messages;
pub mod rules;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use triage_core::ServiceError;
use triage_core::rules::{ActionError, RuleError};

use crate::AppState;

/// Mount every API route group. Nested under `/api` by the caller.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/rules", rules::router())
        .nest("/rule-jobs", jobs::router())
        .nest("/messages", messages::router())
}

/// Error body shared by all endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

pub(crate) fn rule_error_response(err: RuleError, action: &str) -> Response {
    match err {
        RuleError::NotFound(id) => ApiError::not_found(format!("Rule not found: {id}"))
            .into_response_with(StatusCode::NOT_FOUND),
        RuleError::Validation(err) => {
            ApiError::bad_request(err.to_string()).into_response_with(StatusCode::BAD_REQUEST)
        }
        err => {
            tracing::error!(error = %err, "failed to {action}");
            ApiError::internal(format!("Failed to {action}"))
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub(crate) fn service_error_response(err: ServiceError, action: &str) -> Response {
    match err {
        ServiceError::Rule(err) => rule_error_response(err, action),
        ServiceError::MessageNotFound(id) => ApiError::not_found(format!("Message not found: {id}"))
            .into_response_with(StatusCode::NOT_FOUND),
        ServiceError::InvalidConditions(err) => {
            ApiError::bad_request(err.to_string()).into_response_with(StatusCode::BAD_REQUEST)
        }
        ServiceError::Action(err @ ActionError::InvalidConfig { .. }) => {
            ApiError::bad_request(err.to_string()).into_response_with(StatusCode::BAD_REQUEST)
        }
        err => {
            tracing::error!(error = %err, "failed to {action}");
            ApiError::internal(format!("Failed to {action}"))
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
