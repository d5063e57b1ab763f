use crate::engine::MatrixError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<MatrixError> for AppError {
    fn from(err: MatrixError) -> Self {
        let message = err.to_string();
        match err {
            MatrixError::PositionNotFound(_)
            | MatrixError::MemberNotFound(_)
            | MatrixError::OverflowNotFound(_) => AppError::NotFound(message),
            MatrixError::InvalidUpline(_)
            | MatrixError::InvalidPath { .. }
            | MatrixError::InvalidAmount { .. }
            | MatrixError::DepthLimitExceeded { .. } => AppError::BadRequest(message),
            MatrixError::AlreadyEnrolled(_)
            | MatrixError::RootExists(_)
            | MatrixError::SlotOccupied { .. }
            | MatrixError::CycleDetected { .. }
            | MatrixError::NotALeaf(_)
            | MatrixError::HasVolume(_)
            | MatrixError::OverflowNotPending(_)
            | MatrixError::ParentRemoved { .. } => AppError::Conflict(message),
            MatrixError::Contention => AppError::ServiceUnavailable(message),
            MatrixError::InvariantViolation(_) | MatrixError::Storage(_) => {
                AppError::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MemberId, PositionId};

    #[test]
    fn test_matrix_errors_map_to_status() {
        let cases = [
            (
                MatrixError::MemberNotFound(MemberId::random()),
                StatusCode::NOT_FOUND,
            ),
            (
                MatrixError::InvalidUpline(MemberId::random()),
                StatusCode::BAD_REQUEST,
            ),
            (
                MatrixError::NotALeaf(PositionId::new(3)),
                StatusCode::CONFLICT,
            ),
            (MatrixError::Contention, StatusCode::SERVICE_UNAVAILABLE),
            (
                MatrixError::Storage("disk".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), status);
        }
    }
}
