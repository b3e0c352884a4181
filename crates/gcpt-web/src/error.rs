use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gcpt_core::DomainError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{message}")]
    BadRequest {
        message: String,
        details: Vec<String>,
    },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            details: vec![detail.into()],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg, Vec::new()),
            ApiError::BadRequest { message, details } => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message, details)
            }
            ApiError::Domain(err) => match err {
                DomainError::Validation { message, details } => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message, details)
                }
                DomainError::NotFound { .. } => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string(), Vec::new())
                }
                DomainError::Conflict(kind) => {
                    (StatusCode::BAD_REQUEST, "CONFLICT", kind.to_string(), Vec::new())
                }
                DomainError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg, Vec::new()),
                DomainError::Upstream(msg) => {
                    (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", format!("upstream source failed: {msg}"), Vec::new())
                }
                DomainError::Internal(detail) => {
                    error!(error = %detail, "request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "internal server error".to_string(),
                        Vec::new(),
                    )
                }
            },
        };

        let body = ErrorBody {
            error: message,
            code,
            details,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use gcpt_core::ConflictKind;

    fn status(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        assert_eq!(status(DomainError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(DomainError::not_found("opportunity", "1")), StatusCode::NOT_FOUND);
        assert_eq!(status(DomainError::Conflict(ConflictKind::AlreadyWon)), StatusCode::BAD_REQUEST);
        assert_eq!(status(DomainError::Forbidden("admin only".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(DomainError::Upstream("boom".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status(DomainError::Internal("db down".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(ApiError::Unauthorized("missing x-user-id".into())), StatusCode::UNAUTHORIZED);
    }
}
