//! HTTP and real-time gateway for the Parley service.
//!
//! This crate assembles one running service out of three collaborators:
//!
//! - a **persistence connector** ([`parley_db::PersistenceConnector`])
//!   that must connect before anything is reachable
//! - a **route table** ([`RouteTable`]) that mounts HTTP handlers
//! - a **real-time initializer** ([`RealtimeInitializer`]) that registers
//!   `WebSocket` event handlers on the same listener
//!
//! # Architecture
//!
//! [`Bootstrap`] drives a fixed [startup sequence](startup) whose stage
//! dependencies are checked at runtime. The HTTP side is an ordered
//! [pipeline](pipeline) of stages on an [`HttpServer`]:
//!
//! ```text
//! Transport -> Cors -> BodyDecoding -> StaticAssets -> Routes -> Realtime -> ErrorBoundary
//! ```
//!
//! Route mounting and real-time activation happen only after persistence
//! is ready. The error boundary is registered last and seals the
//! pipeline, and the listener is bound only after that, so no client ever
//! observes a half-initialized service.
//!
//! A failing request never takes the listener down: handler panics and
//! unmatched paths are turned into JSON error responses by the
//! [boundary](boundary).

pub mod body;
pub mod bootstrap;
pub mod boundary;
pub mod client_addr;
pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod message_socket;
pub mod pipeline;
pub mod realtime;
pub mod routes;
pub mod startup;

// Re-export primary types for convenience.
pub use bootstrap::{Bootstrap, BootstrapError, READINESS_TARGET, RunningServer};
pub use config::{ConfigError, ServerConfig};
pub use cors::{AllowedOrigins, CorsError, CorsPolicy};
pub use error::ApiError;
pub use message_socket::MessageSocket;
pub use pipeline::{HttpServer, PipelineError, PipelineStage};
pub use realtime::{Broadcaster, Dispatch, Envelope, RealtimeInitializer, RealtimeServer};
pub use routes::{DefaultRoutes, RouteTable};
pub use startup::{STARTUP_SEQUENCE, Stage};
