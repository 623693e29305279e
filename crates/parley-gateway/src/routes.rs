//! The route table boundary and the default table.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/api/health` | Liveness, a persistence ping, and socket status |
//! | `POST` | `/api/messages` | Broadcast a message to real-time clients |
//! | `GET` | `/test-ws` | HTML page exercising the real-time socket |

use std::sync::Arc;

use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use parley_db::PersistenceConnector;

use crate::handlers;
use crate::pipeline::HttpServer;
use crate::realtime::{Broadcaster, RealtimeServer};

/// Path of the socket test page, advertised in the readiness signal.
pub const TEST_PAGE_PATH: &str = "/test-ws";

/// Collaborator that attaches request handlers to the HTTP server.
///
/// Mounted once during bootstrap, after persistence is ready and before
/// the error boundary.
pub trait RouteTable: Send + Sync {
    /// Add zero or more routes to `server`.
    fn mount(&self, server: &mut HttpServer);
}

impl<F> RouteTable for F
where
    F: Fn(&mut HttpServer) + Send + Sync,
{
    fn mount(&self, server: &mut HttpServer) {
        self(server);
    }
}

/// State shared by the default handlers.
#[derive(Debug, Clone)]
pub struct RouteState<P> {
    /// Handle on the connected persistence backend.
    pub persistence: P,
    /// Handle for emitting to real-time clients.
    pub broadcaster: Broadcaster,
    /// When the service started.
    pub started_at: DateTime<Utc>,
}

/// The service's built-in route table.
///
/// Holds a handle on the same backend the bootstrap connects. Connectors
/// whose clones share one connection (such as
/// [`PostgresConnector`](parley_db::PostgresConnector)) let the health
/// route check the live connection.
#[derive(Debug, Clone)]
pub struct DefaultRoutes<P> {
    persistence: P,
    started_at: DateTime<Utc>,
}

impl<P> DefaultRoutes<P>
where
    P: PersistenceConnector + Clone + 'static,
{
    /// Build the table around a handle on the persistence backend.
    pub fn new(persistence: P) -> Self {
        Self {
            persistence,
            started_at: Utc::now(),
        }
    }
}

impl<P> RouteTable for DefaultRoutes<P>
where
    P: PersistenceConnector + Clone + 'static,
{
    fn mount(&self, server: &mut HttpServer) {
        // A server not bound to a real-time transport gets a detached
        // broadcaster that reaches nobody.
        let broadcaster = server
            .broadcaster()
            .cloned()
            .unwrap_or_else(|| RealtimeServer::new().broadcaster());

        let state = Arc::new(RouteState {
            persistence: self.persistence.clone(),
            broadcaster,
            started_at: self.started_at,
        });

        server.route(
            "/api/health",
            get(handlers::health::<P>).with_state(Arc::clone(&state)),
        );
        server.route(
            "/api/messages",
            post(handlers::post_message::<P>).with_state(state),
        );
        server.route(TEST_PAGE_PATH, get(handlers::test_page));
    }
}
