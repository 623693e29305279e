//! Request-time error type for the gateway.
//!
//! [`ApiError`] unifies every failure a handler or pipeline stage can
//! surface into a single enum that converts into a JSON HTTP response via
//! its [`IntoResponse`] implementation. The error boundary produces the
//! same body shape for failures that never became an [`ApiError`]
//! (panics, bare status responses from lower layers).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors that can occur while serving a request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No route or static asset matched the request.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed (bad JSON, bad form encoding).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request origin is not permitted by the cross-origin policy.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request body exceeded the configured limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The request body used a content type the pipeline cannot decode.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status this error maps to.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Serialization(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Build the JSON error body shared by [`ApiError`] and the error boundary.
pub fn error_body(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
    });

    (status, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::NotFound(msg)
            | Self::BadRequest(msg)
            | Self::Forbidden(msg)
            | Self::PayloadTooLarge(msg)
            | Self::UnsupportedMediaType(msg)
            | Self::Internal(msg) => msg.clone(),
            Self::Serialization(e) => format!("JSON error: {e}"),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Request failed");
        }

        error_body(status, &message)
    }
}
