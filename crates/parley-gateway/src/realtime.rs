//! Real-time transport layered over the HTTP listener.
//!
//! [`RealtimeServer`] is created at the same time as the HTTP server and
//! shares its socket: clients upgrade `GET /socket` to a `WebSocket` on
//! the same port. Frames are JSON [`Envelope`]s `{"event": .., "data": ..}`.
//!
//! A [`RealtimeInitializer`] registers event handlers with
//! [`RealtimeServer::on`]. Each handler returns a [`Dispatch`] telling the
//! connection loop whether to reply to the sender, broadcast to every
//! connected client, or do nothing. Broadcasts go through a
//! [`broadcast`] channel so all connections see the same stream.
//!
//! The handshake enforces the same [`CorsPolicy`] as the HTTP pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cors::CorsPolicy;
use crate::error::ApiError;

/// Path the `WebSocket` upgrade is served on.
pub const DEFAULT_SOCKET_PATH: &str = "/socket";

/// Capacity of the broadcast channel.
///
/// A connection that falls behind by more than this many envelopes
/// receives [`broadcast::error::RecvError::Lagged`] and skips ahead.
const BROADCAST_CAPACITY: usize = 256;

/// Event name used for error replies.
pub const ERROR_EVENT: &str = "error";

/// Event name of the greeting sent right after the handshake.
pub const CONNECTED_EVENT: &str = "connected";

/// A single frame on the real-time transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, used to pick a handler.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build an `error` envelope carrying `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            ERROR_EVENT,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

/// What the connection loop does with a handler's result.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Nothing to send.
    None,
    /// Send to the originating connection only.
    Reply(Envelope),
    /// Send to every connected client, including the sender.
    Broadcast(Envelope),
}

/// Errors a handler can report back to its client.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// The frame was not a valid envelope.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// No handler is registered for the event.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The payload did not match what the handler expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Identity of one live real-time connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Connection identifier (UUID v7).
    pub id: Uuid,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            connected_at: Utc::now(),
        }
    }
}

/// A registered event handler.
pub type EventHandler =
    Arc<dyn Fn(&Connection, Value) -> Result<Dispatch, RealtimeError> + Send + Sync>;

/// Collaborator that attaches message-domain handlers to the transport.
///
/// Called once during bootstrap, after persistence is ready. It must
/// only register handlers and return; it must not block.
pub trait RealtimeInitializer: Send + Sync {
    /// Register handlers on `server`.
    fn init(&self, server: &mut RealtimeServer);
}

impl<F> RealtimeInitializer for F
where
    F: Fn(&mut RealtimeServer) + Send + Sync,
{
    fn init(&self, server: &mut RealtimeServer) {
        self(server);
    }
}

/// Handle for pushing envelopes to every connected client from outside
/// the connection loop (for example from an HTTP route).
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Envelope>,
    connections: Arc<AtomicUsize>,
}

impl Broadcaster {
    /// Publish `envelope` to all connected clients.
    ///
    /// Returns the number of connections that received it; `0` when
    /// nobody is connected, which is not an error.
    pub fn emit(&self, envelope: Envelope) -> usize {
        self.tx.send(envelope).unwrap_or(0)
    }

    /// Number of currently open connections.
    pub fn connected_clients(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// The real-time server object bound to the HTTP listener.
pub struct RealtimeServer {
    path: String,
    cors: Option<CorsPolicy>,
    handlers: HashMap<String, EventHandler>,
    broadcaster: Broadcaster,
}

impl std::fmt::Debug for RealtimeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeServer")
            .field("path", &self.path)
            .field("cors", &self.cors)
            .field("events", &self.events())
            .finish_non_exhaustive()
    }
}

impl Default for RealtimeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeServer {
    /// Create a server on [`DEFAULT_SOCKET_PATH`] with no handlers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            path: DEFAULT_SOCKET_PATH.to_owned(),
            cors: None,
            handlers: HashMap::new(),
            broadcaster: Broadcaster {
                tx,
                connections: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// Path the upgrade endpoint is served on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Apply the cross-origin policy checked during the handshake.
    pub fn apply_cors(&mut self, policy: &CorsPolicy) {
        self.cors = Some(policy.clone());
    }

    /// The policy applied by [`apply_cors`](Self::apply_cors), if any.
    pub const fn cors_policy(&self) -> Option<&CorsPolicy> {
        self.cors.as_ref()
    }

    /// Register `handler` for `event`, replacing any earlier handler.
    pub fn on<F>(&mut self, event: &str, handler: F)
    where
        F: Fn(&Connection, Value) -> Result<Dispatch, RealtimeError> + Send + Sync + 'static,
    {
        if self
            .handlers
            .insert(event.to_owned(), Arc::new(handler))
            .is_some()
        {
            warn!(event, "Replacing existing real-time handler");
        }
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    /// A handle for emitting to all clients.
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Freeze the handler table and build the upgrade route.
    pub(crate) fn into_router(self) -> Router {
        let shared = Arc::new(Shared {
            cors: self.cors.unwrap_or_default(),
            handlers: self.handlers,
            broadcaster: self.broadcaster,
        });

        Router::new()
            .route(&self.path, get(upgrade))
            .with_state(shared)
    }
}

/// Immutable state shared by every connection.
struct Shared {
    cors: CorsPolicy,
    handlers: HashMap<String, EventHandler>,
    broadcaster: Broadcaster,
}

impl Shared {
    /// Decode a text frame and run its handler.
    fn dispatch(&self, connection: &Connection, raw: &str) -> Dispatch {
        let outcome = serde_json::from_str::<Envelope>(raw)
            .map_err(|e| RealtimeError::InvalidFrame(e.to_string()))
            .and_then(|envelope| {
                let handler = self
                    .handlers
                    .get(&envelope.event)
                    .ok_or_else(|| RealtimeError::UnknownEvent(envelope.event.clone()))?;
                handler(connection, envelope.data)
            });

        outcome.unwrap_or_else(|e| Dispatch::Reply(Envelope::error(e.to_string())))
    }
}

/// Upgrade `GET /socket` after checking the handshake origin.
async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(shared): State<Arc<Shared>>,
) -> Result<Response, ApiError> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !shared.cors.allows_origin(origin) {
        return Err(ApiError::Forbidden(format!(
            "origin {} is not allowed",
            origin.unwrap_or_default()
        )));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, shared)))
}

async fn send(socket: &mut WebSocket, envelope: &Envelope) -> bool {
    let json = match serde_json::to_string(envelope) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize envelope: {e}");
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

/// Drive one connection: forward broadcasts, dispatch client frames.
async fn handle_socket(mut socket: WebSocket, shared: Arc<Shared>) {
    let connection = Connection::new();
    let counter = Arc::clone(&shared.broadcaster.connections);
    counter.fetch_add(1, Ordering::Relaxed);
    debug!(connection = %connection.id, "Real-time client connected");

    let mut rx = shared.broadcaster.tx.subscribe();

    let greeting = Envelope::new(
        CONNECTED_EVENT,
        serde_json::json!({ "id": connection.id }),
    );
    if send(&mut socket, &greeting).await {
        run_connection(&mut socket, &shared, &connection, &mut rx).await;
    }

    counter.fetch_sub(1, Ordering::Relaxed);
    debug!(connection = %connection.id, "Real-time client disconnected");
}

async fn run_connection(
    socket: &mut WebSocket,
    shared: &Shared,
    connection: &Connection,
    rx: &mut broadcast::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        if !send(socket, &envelope).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Real-time client lagged, skipping ahead");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match shared.dispatch(connection, text.as_str()) {
                            Dispatch::None => {}
                            Dispatch::Reply(envelope) => {
                                if !send(socket, &envelope).await {
                                    return;
                                }
                            }
                            Dispatch::Broadcast(envelope) => {
                                shared.broadcaster.emit(envelope);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(e)) => {
                        debug!("Real-time socket error: {e}");
                        return;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames carry nothing for us.
                    }
                }
            }
        }
    }
}
