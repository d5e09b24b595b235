//! Engine errors as HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jitgate_engine::GateError;
use tracing::error;

use super::json_error;

/// Wraps [`GateError`] so handlers can return it with `?`.
pub(crate) struct ApiError(GateError);

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GateError::PolicyViolation(_) => StatusCode::FORBIDDEN,
            GateError::Conflict(_) => StatusCode::CONFLICT,
            GateError::InvalidSession => StatusCode::BAD_REQUEST,
            GateError::AccessDenied => StatusCode::FORBIDDEN,
            GateError::Unauthorized => StatusCode::FORBIDDEN,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            GateError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GateError::System(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self.0 {
            GateError::System(detail) => {
                error!(%detail, "request failed");
                json_error(status, "internal error").into_response()
            }
            other => json_error(status, &other.to_string()).into_response(),
        }
    }
}
