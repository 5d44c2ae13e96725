use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::transport::TransportError;
use crate::types::ErrorResponse;

/// Every failure the gateway can surface to a caller.
///
/// Client errors (`MissingFields`, `InvalidCircuitId`, `InvalidProofFormat`,
/// `KeyNotFound`) are never retried. `NoCircuitAvailable` and `Transport` may
/// be retried by the caller by resubmitting the whole request.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("missing required fields: {0}")]
    MissingFields(String),

    #[error("invalid circuit id: {0}")]
    InvalidCircuitId(String),

    #[error("invalid proof format: {0}")]
    InvalidProofFormat(String),

    /// Only produced when simulated verification is disabled.
    #[error("verification key not found: {0}")]
    KeyNotFound(String),

    #[error("failed to load verification key for {circuit_id}: {reason}")]
    KeyLoad { circuit_id: String, reason: String },

    #[error("no circuit available: {0}")]
    NoCircuitAvailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingFields(_)
            | GatewayError::InvalidCircuitId(_)
            | GatewayError::InvalidProofFormat(_) => StatusCode::BAD_REQUEST,
            GatewayError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::KeyLoad { .. } | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::NoCircuitAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "{}", self);
        }
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
