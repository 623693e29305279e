//! Request body decoding.
//!
//! Handlers that accept a payload take a [`DecodedBody`] and receive the
//! body as a JSON value regardless of whether the client sent JSON or an
//! HTML form. The size limit is enforced by the `BodyDecoding` pipeline
//! stage ([`DefaultBodyLimit`](axum::extract::DefaultBodyLimit)); this
//! extractor maps an over-limit body to `413`.

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{StatusCode, header};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// A request body decoded from `application/json` or
/// `application/x-www-form-urlencoded`.
///
/// An empty body decodes to an empty object. Form fields are decoded as
/// strings; a repeated key keeps its last value.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody(pub Value);

/// Supported body encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    Form,
    Other,
    Unspecified,
}

fn encoding_of(req: &Request) -> Encoding {
    let Some(content_type) = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return Encoding::Unspecified;
    };

    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime == "application/json" || mime.ends_with("+json") {
        Encoding::Json
    } else if mime == "application/x-www-form-urlencoded" {
        Encoding::Form
    } else {
        Encoding::Other
    }
}

impl<S> FromRequest<S> for DecodedBody
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let encoding = encoding_of(&req);

        let bytes = Bytes::from_request(req, state).await.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge(rejection.body_text())
            } else {
                ApiError::BadRequest(rejection.body_text())
            }
        })?;

        if bytes.is_empty() {
            return Ok(Self(Value::Object(Map::new())));
        }

        match encoding {
            Encoding::Json => serde_json::from_slice(&bytes)
                .map(Self)
                .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}"))),
            Encoding::Form => {
                let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&bytes)
                    .map_err(|e| ApiError::BadRequest(format!("invalid form body: {e}")))?;
                let object: Map<String, Value> = pairs
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect();
                Ok(Self(Value::Object(object)))
            }
            Encoding::Other | Encoding::Unspecified => Err(ApiError::UnsupportedMediaType(
                String::from("expected application/json or application/x-www-form-urlencoded"),
            )),
        }
    }
}
