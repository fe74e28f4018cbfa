//! API Error Handling
//!
//! Structured error responses with proper HTTP status codes and request tracking.

use crate::errors::CrashError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code (VALIDATION_ERROR, NOT_FOUND, ALREADY_SETTLED, etc.)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error types with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },
    /// Request is well formed but conflicts with the round or bet state
    Conflict {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn validation(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Validation { message, details: None },
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message),
            request_id,
        }
    }

    pub fn service_unavailable(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::ServiceUnavailable(message),
            request_id,
        }
    }

    fn conflict(request_id: String, code: &'static str, message: String, details: Option<serde_json::Value>) -> Self {
        Self {
            kind: ApiErrorKind::Conflict { code, message, details },
            request_id,
        }
    }

    /// Map an engine error onto its HTTP representation
    pub fn from_crash(request_id: String, err: CrashError) -> Self {
        let message = err.to_string();
        match err {
            CrashError::Validation { field, reason } => Self {
                kind: ApiErrorKind::Validation {
                    message,
                    details: Some(json!({ "field": field, "reason": reason })),
                },
                request_id,
            },
            CrashError::RoundNotFound(_) | CrashError::PersistedIdNotFound(_) | CrashError::BetNotFound(_) => {
                Self::not_found(request_id, message)
            }
            CrashError::InvalidTransition { from, to } => Self::conflict(
                request_id,
                "INVALID_TRANSITION",
                message,
                Some(json!({ "from": from, "to": to })),
            ),
            CrashError::BettingClosed { status, .. } => {
                Self::conflict(request_id, "BETTING_CLOSED", message, Some(json!({ "status": status })))
            }
            CrashError::RoundNotRunning { status, .. } => {
                Self::conflict(request_id, "ROUND_NOT_RUNNING", message, Some(json!({ "status": status })))
            }
            CrashError::NotRevealed { status, .. } => {
                Self::conflict(request_id, "NOT_REVEALED", message, Some(json!({ "status": status })))
            }
            CrashError::AlreadySettled { settlement, .. } => Self::conflict(
                request_id,
                "ALREADY_SETTLED",
                message,
                serde_json::to_value(&settlement).ok(),
            ),
            CrashError::StaleMultiplier { requested, live } => Self::conflict(
                request_id,
                "STALE_MULTIPLIER",
                message,
                Some(json!({ "requested": requested, "live": live })),
            ),
            CrashError::Storage(_) => Self::service_unavailable(request_id, message),
            CrashError::Configuration(_) | CrashError::Metrics(_) => Self::internal_error(request_id, message),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => write!(f, "[{}] Not Found: {}", self.request_id, msg),
            ApiErrorKind::Validation { message, .. } => write!(f, "[{}] Validation: {}", self.request_id, message),
            ApiErrorKind::Conflict { code, message, .. } => write!(f, "[{}] {}: {}", self.request_id, code, message),
            ApiErrorKind::InternalError(msg) => write!(f, "[{}] Internal Error: {}", self.request_id, msg),
            ApiErrorKind::ServiceUnavailable(msg) => write!(f, "[{}] Service Unavailable: {}", self.request_id, msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            ApiErrorKind::Validation { message, details } => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message, details)
            }
            ApiErrorKind::Conflict { code, message, details } => (StatusCode::CONFLICT, code, message, details),
            ApiErrorKind::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg, None),
            ApiErrorKind::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg, None)
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}
