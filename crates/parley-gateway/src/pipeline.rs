//! Request pipeline: ordered stage registration on the HTTP server.
//!
//! [`HttpServer`] is the server handle owned by the bootstrap. Stages are
//! appended to it in a fixed order and recorded as [`PipelineStage`]s:
//!
//! ```text
//! Transport -> Cors -> BodyDecoding -> StaticAssets -> Routes -> Realtime -> ErrorBoundary
//! ```
//!
//! Registration order is the order stages see a request, as in a
//! middleware chain. The error boundary is registered last and seals the
//! pipeline: anything appended afterwards is recorded as a violation and
//! [`HttpServer::into_router`] refuses to build. When the router is
//! materialized the boundary wraps the handler set directly, so every
//! response it produces still flows back out through the earlier stages
//! (CORS headers, request tracing).
//!
//! Each path may be mounted once. Handlers for several methods on one path
//! belong in a single [`MethodRouter`] (`get(a).post(b)`). A path mounted
//! twice, a path without a leading `/`, or a route on the real-time
//! upgrade path is recorded as a violation instead of reaching axum,
//! which would panic on it.

use std::path::{Path, PathBuf};

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::handler::HandlerWithoutStateExt;
use axum::middleware;
use axum::routing::MethodRouter;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::boundary;
use crate::client_addr::resolve_client_addr;
use crate::config::ServerConfig;
use crate::cors::CorsPolicy;
use crate::realtime::{Broadcaster, RealtimeServer};
use crate::routes::RouteTable;

/// One registered pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStage {
    /// Request tracing and client address resolution.
    Transport,
    /// Cross-origin policy.
    Cors,
    /// JSON / URL-encoded body decoding with a size limit.
    BodyDecoding {
        /// Maximum body size in bytes.
        limit: usize,
    },
    /// Static files served from `root`.
    StaticAssets {
        /// Asset directory.
        root: PathBuf,
    },
    /// The route table.
    Routes {
        /// Number of routes the table mounted.
        count: usize,
    },
    /// The real-time upgrade endpoint.
    Realtime {
        /// Upgrade path.
        path: String,
    },
    /// The terminal error boundary.
    ErrorBoundary,
}

impl PipelineStage {
    /// Short stage name for logs and errors.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Cors => "cors",
            Self::BodyDecoding { .. } => "body-decoding",
            Self::StaticAssets { .. } => "static-assets",
            Self::Routes { .. } => "routes",
            Self::Realtime { .. } => "realtime",
            Self::ErrorBoundary => "error-boundary",
        }
    }
}

/// Ways the pipeline can be assembled incorrectly.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Something was appended after the error boundary.
    #[error("{0} appended after the error boundary")]
    AfterBoundary(&'static str),

    /// The router was requested before the boundary was attached.
    #[error("pipeline has no error boundary")]
    Unsealed,

    /// A route path does not start with `/`.
    #[error("route path {0:?} must start with '/'")]
    InvalidPath(String),

    /// The same path (up to parameter names) was mounted twice.
    #[error("route {0} mounted more than once")]
    DuplicateRoute(String),

    /// A route claims the real-time upgrade path.
    #[error("route {0} collides with the real-time upgrade endpoint")]
    RouteConflict(String),
}

/// The HTTP server handle: route set plus the ordered stage list.
#[derive(Debug, Default)]
pub struct HttpServer {
    routes: Router,
    route_count: usize,
    paths: Vec<String>,
    stages: Vec<PipelineStage>,
    cors: Option<CorsPolicy>,
    realtime: Option<Router>,
    broadcaster: Option<Broadcaster>,
    violations: Vec<PipelineError>,
}

impl HttpServer {
    /// An empty server with no stages.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty server sharing its transport with `realtime`.
    ///
    /// Routes mounted later can reach real-time clients through
    /// [`broadcaster`](Self::broadcaster).
    pub fn bound_to(realtime: &RealtimeServer) -> Self {
        Self {
            broadcaster: Some(realtime.broadcaster()),
            ..Self::default()
        }
    }

    /// Emitter for the real-time server this one is bound to.
    pub const fn broadcaster(&self) -> Option<&Broadcaster> {
        self.broadcaster.as_ref()
    }

    /// Stages registered so far, in registration order.
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Whether the error boundary has been attached.
    pub fn is_sealed(&self) -> bool {
        self.stages.contains(&PipelineStage::ErrorBoundary)
    }

    /// Total routes added through [`route`](Self::route).
    pub const fn route_count(&self) -> usize {
        self.route_count
    }

    /// The cross-origin policy applied to HTTP, if any.
    pub const fn cors_policy(&self) -> Option<&CorsPolicy> {
        self.cors.as_ref()
    }

    fn push(&mut self, stage: PipelineStage) -> bool {
        if self.is_sealed() {
            warn!(stage = stage.name(), "Stage appended after error boundary");
            self.violations.push(PipelineError::AfterBoundary(stage.name()));
            return false;
        }
        debug!(stage = stage.name(), "Pipeline stage registered");
        self.stages.push(stage);
        true
    }

    /// Register request tracing and client address resolution.
    pub fn use_transport(&mut self) {
        self.push(PipelineStage::Transport);
    }

    /// Apply the cross-origin policy to every HTTP response.
    pub fn apply_cors(&mut self, policy: &CorsPolicy) {
        if self.push(PipelineStage::Cors) {
            self.cors = Some(policy.clone());
        }
    }

    /// Limit and decode request bodies.
    pub fn use_body_decoding(&mut self, limit: usize) {
        self.push(PipelineStage::BodyDecoding { limit });
    }

    /// Serve files under `root` for paths no route claims.
    pub fn serve_static(&mut self, root: &Path) {
        if !root.is_dir() {
            warn!(root = %root.display(), "Static asset directory not found, serving none");
        }
        self.push(PipelineStage::StaticAssets {
            root: root.to_path_buf(),
        });
    }

    fn reject(&mut self, violation: PipelineError) {
        warn!(error = %violation, "Pipeline violation recorded");
        self.violations.push(violation);
    }

    fn is_mounted(&self, path: &str) -> bool {
        let shape = route_shape(path);
        self.paths.iter().any(|mounted| route_shape(mounted) == shape)
    }

    /// Add a route. Called by [`RouteTable::mount`].
    ///
    /// Invalid or repeated paths are recorded as violations and the route
    /// is skipped.
    pub fn route(&mut self, path: &str, method_router: MethodRouter) {
        if self.is_sealed() {
            self.reject(PipelineError::AfterBoundary("route"));
            return;
        }
        if !path.starts_with('/') {
            self.reject(PipelineError::InvalidPath(path.to_owned()));
            return;
        }
        if self.is_mounted(path) {
            self.reject(PipelineError::DuplicateRoute(path.to_owned()));
            return;
        }
        self.routes = std::mem::take(&mut self.routes).route(path, method_router);
        self.paths.push(path.to_owned());
        self.route_count = self.route_count.saturating_add(1);
    }

    fn record_routes(&mut self, count: usize) {
        self.push(PipelineStage::Routes { count });
    }

    /// Attach the real-time upgrade endpoint. The server is consumed; its
    /// handler table is frozen from here on.
    ///
    /// Fails (as a recorded violation) if a route already claims the
    /// upgrade path.
    pub fn attach_realtime(&mut self, realtime: RealtimeServer) {
        let path = realtime.path().to_owned();
        if self.is_mounted(&path) {
            self.reject(PipelineError::RouteConflict(path));
            return;
        }
        if self.push(PipelineStage::Realtime { path }) {
            self.realtime = Some(realtime.into_router());
        }
    }

    /// Append the error boundary and seal the pipeline.
    pub fn attach_error_boundary(&mut self) {
        self.push(PipelineStage::ErrorBoundary);
    }

    /// Materialize the router.
    ///
    /// Fails if the pipeline was never sealed or if anything was appended
    /// after the boundary.
    pub fn into_router(self) -> Result<Router, PipelineError> {
        let sealed = self.is_sealed();
        let Self {
            routes,
            stages,
            cors,
            realtime,
            violations,
            ..
        } = self;

        if let Some(violation) = violations.into_iter().next() {
            return Err(violation);
        }
        if !sealed {
            return Err(PipelineError::Unsealed);
        }

        let mut router = routes;
        if let Some(realtime) = realtime {
            router = router.merge(realtime);
        }

        let static_root = stages.iter().find_map(|stage| match stage {
            PipelineStage::StaticAssets { root } => Some(root.clone()),
            _ => None,
        });
        router = match static_root {
            Some(root) => router.fallback_service(
                ServeDir::new(root)
                    .call_fallback_on_method_not_allowed(true)
                    .not_found_service(boundary::not_found.into_service()),
            ),
            None => router.fallback(boundary::not_found),
        };

        router = boundary::wrap(router);

        // Earlier stages end up outermost.
        for stage in stages.iter().rev() {
            router = match stage {
                PipelineStage::Transport => router
                    .layer(middleware::from_fn(resolve_client_addr))
                    .layer(TraceLayer::new_for_http()),
                PipelineStage::Cors => match &cors {
                    Some(policy) => router.layer(policy.layer()),
                    None => router,
                },
                PipelineStage::BodyDecoding { limit } => router.layer(DefaultBodyLimit::max(*limit)),
                PipelineStage::StaticAssets { .. }
                | PipelineStage::Routes { .. }
                | PipelineStage::Realtime { .. }
                | PipelineStage::ErrorBoundary => router,
            };
        }

        Ok(router)
    }
}

/// Path with parameter names erased: `/users/{id}` and `/users/{name}`
/// are the same route.
fn route_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.starts_with("{*") {
                "{*}"
            } else if segment.starts_with('{') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Register the generic stages every route relies on: body decoding and
/// static assets.
pub fn configure_generic(server: &mut HttpServer, config: &ServerConfig) {
    server.use_body_decoding(config.body_limit);
    server.serve_static(&config.public_dir);
}

/// Mount `table` and record the `Routes` stage.
pub fn mount_routes<R>(server: &mut HttpServer, table: &R)
where
    R: RouteTable + ?Sized,
{
    let before = server.route_count();
    table.mount(server);
    let mounted = server.route_count().saturating_sub(before);
    server.record_routes(mounted);
}

/// Register the complete pipeline in one call: transport, CORS, generic
/// stages, routes, then the error boundary.
///
/// The bootstrap performs the same steps individually so it can wait for
/// persistence between the generic stages and the routes.
pub fn configure<R>(server: &mut HttpServer, config: &ServerConfig, table: &R)
where
    R: RouteTable + ?Sized,
{
    server.use_transport();
    server.apply_cors(&config.cors);
    configure_generic(server, config);
    mount_routes(server, table);
    server.attach_error_boundary();
}
