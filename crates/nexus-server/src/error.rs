//! Maps [`NexusError`] onto the HTTP status codes and `{"err": <code>}`
//! bodies from spec.md 6/7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nexus_core::NexusError;

pub struct AppError(pub NexusError);

impl From<NexusError> for AppError {
    fn from(e: NexusError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            NexusError::BadInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            NexusError::LowEntropy(_) => (StatusCode::BAD_REQUEST, "low_entropy"),
            NexusError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            NexusError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            NexusError::SoftDeleted => (StatusCode::NOT_FOUND, "not_found"),
            NexusError::AlreadyInitialized => (StatusCode::BAD_REQUEST, "bad_request"),
            NexusError::KekRetired(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_fault"),
            NexusError::CryptoFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            NexusError::BackendUnavailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_fault"),
            NexusError::Cancelled | NexusError::Timeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_fault"),
            NexusError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        tracing::warn!(error = %self.0, code, "request failed");

        (status, axum::Json(serde_json::json!({"err": code}))).into_response()
    }
}
