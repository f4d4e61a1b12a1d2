use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::responses::ApiResponse;
use crate::error::AppError;

/// Unified API error wrapper mapping domain errors to HTTP responses.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::InvalidTransactionState(_) => (StatusCode::BAD_REQUEST, "INVALID_STATE"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::IdempotencyConflict(_) => (StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT"),
            _ => {
                tracing::error!(error = %self.0, kind = self.0.kind(), "internal error in API handler");
                let body = Json(ApiResponse::<()>::error(
                    "INTERNAL_ERROR",
                    "internal server error",
                ));
                return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
            }
        };

        let body = Json(ApiResponse::<()>::error(code, self.0.to_string()));
        (status, body).into_response()
    }
}
