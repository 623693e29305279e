//! The error boundary: terminal stage of the request pipeline.
//!
//! Everything that goes wrong after the listener is up ends here and
//! leaves as a JSON error body with the same shape as [`ApiError`]:
//!
//! - unmatched paths hit [`not_found`]
//! - handler panics are caught by [`CatchPanicLayer`] and become `500`
//! - bare error responses produced by lower layers (body limit, method
//!   not allowed, static file errors) are rewritten by
//!   [`normalize_error_response`]
//!
//! A panicking request never takes the listener down.

use std::any::Any;

use axum::Router;
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware;
use axum::response::Response;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::error;

use crate::error::{ApiError, error_body};

/// Fallback for requests no route or static asset matched.
pub async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::NotFound(format!("{method} {} not found", uri.path()))
}

/// Convert a caught handler panic into a `500` response.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");

    error!(panic = detail, "Request handler panicked");

    error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// Rewrite non-JSON `4xx`/`5xx` responses into the JSON error shape.
///
/// Headers other than the body framing ones are kept, so CORS and
/// `Allow` headers survive.
pub async fn normalize_error_response(response: Response) -> Response {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) || is_json(&response) {
        return response;
    }

    let reason = status.canonical_reason().unwrap_or("request failed");
    let mut normalized = error_body(status, &reason.to_ascii_lowercase());

    for (name, value) in response.headers() {
        if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
            normalized.headers_mut().append(name.clone(), value.clone());
        }
    }
    normalized.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    normalized
}

/// Wrap `router` in the boundary layers.
///
/// Must be the last layer applied by the pipeline so that every stage
/// registered before it is covered.
pub fn wrap(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::map_response(normalize_error_response))
}
