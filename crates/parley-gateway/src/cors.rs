//! Cross-origin policy shared by the HTTP pipeline and the real-time
//! transport.
//!
//! A single [`CorsPolicy`] value is handed to both layers during
//! bootstrap. The HTTP side turns it into a [`CorsLayer`]; the real-time
//! side checks the handshake `Origin` against it. Keeping one value means
//! browsers never see divergent rules between the two.
//!
//! The default is an open API posture: any origin, the usual REST
//! methods, any request header, credentials disabled. Deployments that
//! need something tighter set `CORS_ALLOWED_ORIGINS`.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

/// Origins permitted to call the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// Any origin (`*`).
    Any,
    /// Exactly these origins, e.g. `https://app.example.com`.
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Parse `*` or a comma-separated origin list.
    pub fn parse(raw: &str) -> Self {
        let origins: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect();

        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            Self::Any
        } else {
            Self::List(origins)
        }
    }
}

/// Request headers permitted on cross-origin calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedHeaders {
    /// Any header (`*`).
    Any,
    /// Exactly these headers.
    List(Vec<HeaderName>),
}

/// Policies a browser would refuse, or that the HTTP layer cannot express.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorsError {
    /// Credentials were enabled together with the `*` origin.
    #[error("credentials cannot be combined with a wildcard origin")]
    CredentialsWithWildcardOrigin,
}

/// The full cross-origin policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    /// Permitted origins.
    pub origins: AllowedOrigins,
    /// Permitted methods.
    pub methods: Vec<Method>,
    /// Permitted request headers.
    pub headers: AllowedHeaders,
    /// Whether cookies and auth headers may accompany requests.
    pub allow_credentials: bool,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            origins: AllowedOrigins::Any,
            methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
                Method::OPTIONS,
            ],
            headers: AllowedHeaders::Any,
            allow_credentials: false,
        }
    }
}

impl CorsPolicy {
    /// Check the policy before any layer is built from it.
    pub fn validate(&self) -> Result<(), CorsError> {
        if self.allow_credentials && self.origins == AllowedOrigins::Any {
            return Err(CorsError::CredentialsWithWildcardOrigin);
        }
        Ok(())
    }

    /// Build the tower-http layer enforcing this policy on HTTP routes.
    ///
    /// With credentials enabled a `*` header list is sent as the mirrored
    /// request headers, since browsers reject `*` alongside credentials.
    /// Call [`validate`](Self::validate) first.
    pub fn layer(&self) -> CorsLayer {
        let origin = match &self.origins {
            AllowedOrigins::Any => AllowOrigin::any(),
            AllowedOrigins::List(list) => AllowOrigin::list(
                list.iter()
                    .filter_map(|o| HeaderValue::from_str(o).ok())
                    .collect::<Vec<_>>(),
            ),
        };

        let headers = match &self.headers {
            AllowedHeaders::Any if self.allow_credentials => AllowHeaders::mirror_request(),
            AllowedHeaders::Any => AllowHeaders::any(),
            AllowedHeaders::List(list) => AllowHeaders::list(list.iter().cloned()),
        };

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(AllowMethods::list(self.methods.iter().cloned()))
            .allow_headers(headers)
            .allow_credentials(self.allow_credentials)
    }

    /// Whether a request carrying `origin` may proceed.
    ///
    /// Requests without an `Origin` header come from non-browser clients
    /// and are always allowed.
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        match (&self.origins, origin) {
            (AllowedOrigins::Any, _) | (AllowedOrigins::List(_), None) => true,
            (AllowedOrigins::List(list), Some(origin)) => list.iter().any(|o| o == origin),
        }
    }
}
