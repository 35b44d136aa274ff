//! Error types for referral-service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use referral_core::ReferralError;
use serde::Serialize;
use thiserror::Error;

/// Startup and lifecycle errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] ReferralError),
}

/// Errors surfaced to HTTP callers
#[derive(Debug, Error)]
pub enum ApiError {
    /// No caller identity on the request
    #[error("missing or malformed x-user-id header")]
    Unauthenticated,

    /// Caller lacks the required role
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed request outside the core's field checks
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Request body failed schema validation
    #[error("validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Core(#[from] ReferralError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Core(err) => match err {
                ReferralError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ReferralError::NotFound { .. } | ReferralError::CodeNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                ReferralError::Expired { .. } => StatusCode::GONE,
                ReferralError::QuotaExceeded { .. }
                | ReferralError::Conflict(_)
                | ReferralError::InvalidTransition(_) => StatusCode::CONFLICT,
                ReferralError::GenerationExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                ReferralError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "UNAUTHENTICATED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Core(err) => err.reason(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Validation(errors) => serde_json::to_value(errors).ok(),
            ApiError::Core(ReferralError::Validation(fields)) => serde_json::to_value(fields).ok(),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            ApiError::Core(ReferralError::Persistence(detail)) => {
                tracing::error!(%detail, "persistence failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error,
            code: self.code().to_string(),
            details: self.details(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn core_errors_map_to_http_statuses() {
        let cases = [
            (ReferralError::invalid_field("email", "bad"), StatusCode::UNPROCESSABLE_ENTITY),
            (ReferralError::not_found("program", "p-1"), StatusCode::NOT_FOUND),
            (ReferralError::CodeNotFound("NOPE".into()), StatusCode::NOT_FOUND),
            (
                ReferralError::Expired {
                    code: "OLD".into(),
                    valid_until: Utc::now(),
                },
                StatusCode::GONE,
            ),
            (
                ReferralError::QuotaExceeded {
                    code: "ABC123".into(),
                    max_uses: 1,
                },
                StatusCode::CONFLICT,
            ),
            (ReferralError::InvalidTransition("x".into()), StatusCode::CONFLICT),
            (
                ReferralError::GenerationExhausted { attempts: 20 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ReferralError::Persistence("pool timed out".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn identity_errors_use_auth_statuses() {
        assert_eq!(
            ApiError::Unauthenticated.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Forbidden("trainer role required".into())
                .into_response()
                .status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn reason_codes_come_from_core() {
        let err = ApiError::from(ReferralError::CodeNotFound("NOPE".into()));
        assert_eq!(err.code(), "CODE_NOT_FOUND");
        assert!(err.details().is_none());
    }
}
