//! End-to-end tests for the bootstrap orchestrator.
//!
//! Unlike `api_tests.rs` these bind a real listener on loopback and talk
//! to it over TCP with `reqwest` and `tokio-tungstenite`, so they cover
//! the ordering between persistence, binding, and readiness.

#![allow(clippy::unwrap_used, clippy::panic, clippy::unreachable)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_db::{DbError, PersistenceConnector};
use parley_gateway::{
    Bootstrap, BootstrapError, DefaultRoutes, Envelope, HttpServer, MessageSocket, PipelineError,
    READINESS_TARGET, RealtimeServer, RunningServer, STARTUP_SEQUENCE,
};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

// =========================================================================
// Collaborators
// =========================================================================

#[derive(Clone, Copy)]
struct Ready;

impl PersistenceConnector for Ready {
    fn name(&self) -> &'static str {
        "ready"
    }

    async fn connect(&self) -> Result<(), DbError> {
        Ok(())
    }
}

struct Refusing;

impl PersistenceConnector for Refusing {
    fn name(&self) -> &'static str {
        "refusing"
    }

    async fn connect(&self) -> Result<(), DbError> {
        Err(DbError::Unavailable(String::from("connection refused")))
    }
}

#[derive(Clone)]
struct Gated(Arc<Notify>);

impl PersistenceConnector for Gated {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn connect(&self) -> Result<(), DbError> {
        self.0.notified().await;
        Ok(())
    }
}

struct Hanging;

impl PersistenceConnector for Hanging {
    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn connect(&self) -> Result<(), DbError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Connected/closed flags shared by every clone.
#[derive(Clone, Default)]
struct Tracked {
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl PersistenceConnector for Tracked {
    fn name(&self) -> &'static str {
        "tracked"
    }

    async fn connect(&self) -> Result<(), DbError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), DbError> {
        if self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Unavailable(String::from("not connected")))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn empty_table(_: &mut HttpServer) {}

fn no_handlers(_: &mut RealtimeServer) {}

// =========================================================================
// Helpers
// =========================================================================

fn env(port: u16, extra: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
    let mut vars: HashMap<String, String> = HashMap::from([
        (String::from("HOST"), String::from("http://localhost")),
        (String::from("PORT"), port.to_string()),
        (String::from("BIND_ADDR"), String::from("127.0.0.1")),
        (String::from("PUBLIC_DIR"), String::from("/nonexistent/parley-public")),
        (String::from("DB_CONNECT_RETRIES"), String::from("0")),
    ]);
    for (k, v) in extra {
        vars.insert((*k).to_owned(), (*v).to_owned());
    }
    move |key: &str| vars.get(key).cloned()
}

/// A loopback port that was free a moment ago.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn is_listening(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

fn socket_url(server: &RunningServer) -> String {
    format!("ws://{}/socket", server.local_addr())
}

fn http_url(server: &RunningServer, path: &str) -> String {
    format!("http://{}{path}", server.local_addr())
}

fn envelope_of(msg: &Message) -> Envelope {
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

// =========================================================================
// Startup scenario
// =========================================================================

#[tokio::test]
async fn empty_table_serves_not_found_and_socket() {
    let server = Bootstrap::new(Ready, empty_table, MessageSocket)
        .start(env(0, &[]))
        .await
        .unwrap();

    assert_eq!(server.startup_stages(), &STARTUP_SEQUENCE);
    assert!(server.base_url().starts_with("http://localhost:"));
    assert_ne!(server.local_addr().port(), 0);

    let response = reqwest::get(http_url(&server, "/anything")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["status"], 404);
    assert_eq!(json["error"], "GET /anything not found");

    let (mut ws, _) = tokio_tungstenite::connect_async(socket_url(&server))
        .await
        .unwrap();

    let greeting = envelope_of(&ws.next().await.unwrap().unwrap());
    assert_eq!(greeting.event, "connected");
    assert!(greeting.data["id"].is_string());

    ws.send(Message::text(r#"{"event":"ping","data":{"n":7}}"#))
        .await
        .unwrap();
    let pong = envelope_of(&ws.next().await.unwrap().unwrap());
    assert_eq!(pong, Envelope::new("pong", json!({"n": 7})));

    ws.close(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn socket_messages_reach_every_client() {
    let server = Bootstrap::new(Ready, DefaultRoutes::new(Ready), MessageSocket)
        .start(env(0, &[]))
        .await
        .unwrap();

    let (mut alice, _) = tokio_tungstenite::connect_async(socket_url(&server))
        .await
        .unwrap();
    let (mut bob, _) = tokio_tungstenite::connect_async(socket_url(&server))
        .await
        .unwrap();
    alice.next().await.unwrap().unwrap();
    bob.next().await.unwrap().unwrap();

    alice
        .send(Message::text(r#"{"event":"message","data":{"text":"hi bob"}}"#))
        .await
        .unwrap();

    for client in [&mut alice, &mut bob] {
        let env = envelope_of(&client.next().await.unwrap().unwrap());
        assert_eq!(env.event, "message");
        assert_eq!(env.data["text"], "hi bob");
    }

    // Messages posted over HTTP are broadcast the same way.
    let response = reqwest::Client::new()
        .post(http_url(&server, "/api/messages"))
        .json(&json!({"text": "from http"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["delivered"], 2);

    let env = envelope_of(&bob.next().await.unwrap().unwrap());
    assert_eq!(env.data["text"], "from http");

    server.shutdown().await.unwrap();
}

// =========================================================================
// Fatal startup errors
// =========================================================================

#[tokio::test]
async fn missing_host_or_port_binds_nothing() {
    let port = free_port();
    let port_str = port.to_string();

    let only_port = |key: &str| (key == "PORT").then(|| port_str.clone());
    let err = Bootstrap::new(Ready, empty_table, no_handlers)
        .start(only_port)
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Config(_)));

    let only_host = |key: &str| (key == "HOST").then(|| String::from("localhost"));
    let err = Bootstrap::new(Ready, empty_table, no_handlers)
        .start(only_host)
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Config(_)));

    assert!(!is_listening(port).await);
}

#[tokio::test]
async fn rejected_connect_binds_nothing() {
    let port = free_port();

    let err = Bootstrap::new(Refusing, empty_table, no_handlers)
        .start(env(port, &[]))
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::Persistence(_)));
    assert!(!is_listening(port).await);
}

#[tokio::test]
async fn hanging_connect_times_out_before_bind() {
    let port = free_port();

    let err = Bootstrap::new(Hanging, empty_table, no_handlers)
        .start(env(port, &[("DB_CONNECT_TIMEOUT_MS", "50")]))
        .await
        .unwrap_err();

    match err {
        BootstrapError::Persistence(DbError::Exhausted { last, .. }) => {
            assert!(matches!(*last, DbError::Timeout { .. }));
        }
        other => panic!("expected persistence timeout, got {other}"),
    }
    assert!(!is_listening(port).await);
}

#[tokio::test]
async fn port_in_use_is_a_bind_error() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = Bootstrap::new(Ready, empty_table, no_handlers)
        .start(env(port, &[]))
        .await
        .unwrap_err();

    match err {
        BootstrapError::Bind { addr, source } => {
            assert_eq!(addr.port(), port);
            assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
        }
        other => panic!("expected bind error, got {other}"),
    }
}

// =========================================================================
// Ordering
// =========================================================================

#[tokio::test]
async fn slow_connect_delays_listener() {
    let port = free_port();
    let gate = Arc::new(Notify::new());

    let gated = Gated(Arc::clone(&gate));
    let startup = tokio::spawn(
        Bootstrap::new(gated.clone(), DefaultRoutes::new(gated), MessageSocket)
            .start(env(port, &[])),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!is_listening(port).await, "listener bound before persistence");

    gate.notify_one();
    let server = startup.await.unwrap().unwrap();

    let response = reqwest::get(http_url(&server, "/api/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["persistence"], "gated");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_releases_the_port() {
    let server = Bootstrap::new(Ready, empty_table, no_handlers)
        .start(env(0, &[]))
        .await
        .unwrap();
    let port = server.local_addr().port();
    assert!(is_listening(port).await);

    server.shutdown().await.unwrap();
    assert!(!is_listening(port).await);
}

#[tokio::test]
async fn persistence_stays_open_until_shutdown() {
    let tracked = Tracked::default();
    let server = Bootstrap::new(
        tracked.clone(),
        DefaultRoutes::new(tracked.clone()),
        MessageSocket,
    )
    .start(env(0, &[]))
    .await
    .unwrap();

    // Let any post-readiness cleanup run.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!tracked.closed.load(Ordering::SeqCst), "closed while serving");

    let response = reqwest::get(http_url(&server, "/api/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["persistence"], "tracked");
    assert_eq!(json["persistence_reachable"], true);

    server.shutdown().await.unwrap();
    assert!(tracked.closed.load(Ordering::SeqCst), "not closed after shutdown");
}

#[tokio::test]
async fn route_on_socket_path_binds_nothing() {
    let port = free_port();
    let claims_socket = |server: &mut HttpServer| {
        server.route("/socket", axum::routing::get(|| async { "mine" }));
    };
    let tracked = Tracked::default();

    let err = Bootstrap::new(tracked.clone(), claims_socket, MessageSocket)
        .start(env(port, &[]))
        .await
        .unwrap_err();

    match err {
        BootstrapError::Pipeline(PipelineError::RouteConflict(path)) => {
            assert_eq!(path, "/socket");
        }
        other => panic!("expected route conflict, got {other}"),
    }
    assert!(!is_listening(port).await);
    assert!(tracked.closed.load(Ordering::SeqCst));
}

// =========================================================================
// Cross-origin policy
// =========================================================================

#[tokio::test]
async fn http_and_socket_share_origin_policy() {
    let server = Bootstrap::new(Ready, DefaultRoutes::new(Ready), MessageSocket)
        .start(env(0, &[("CORS_ALLOWED_ORIGINS", "https://trusted.example")]))
        .await
        .unwrap();
    let client = reqwest::Client::new();

    for (origin, allowed) in [("https://trusted.example", true), ("https://evil.example", false)] {
        let response = client
            .get(http_url(&server, "/api/health"))
            .header("origin", origin)
            .send()
            .await
            .unwrap();
        let echoed = response.headers().get("access-control-allow-origin").is_some();
        assert_eq!(echoed, allowed, "HTTP origin {origin}");

        let mut request = socket_url(&server).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_str(origin).unwrap());
        match tokio_tungstenite::connect_async(request).await {
            Ok((mut ws, _)) => {
                assert!(allowed, "socket accepted {origin}");
                ws.close(None).await.unwrap();
            }
            Err(WsError::Http(response)) => {
                assert!(!allowed, "socket rejected {origin}");
                assert_eq!(response.status().as_u16(), 403);
            }
            Err(other) => panic!("unexpected handshake error: {other}"),
        }
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn credentialed_origin_list_starts_and_mirrors_headers() {
    let server = Bootstrap::new(Ready, DefaultRoutes::new(Ready), MessageSocket)
        .start(env(
            0,
            &[
                ("CORS_ALLOWED_ORIGINS", "https://trusted.example"),
                ("CORS_ALLOW_CREDENTIALS", "true"),
            ],
        ))
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, http_url(&server, "/api/messages"))
        .header("origin", "https://trusted.example")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type,x-request-id")
        .send()
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "https://trusted.example");
    assert_eq!(headers["access-control-allow-credentials"], "true");
    assert_eq!(
        headers["access-control-allow-headers"],
        "content-type,x-request-id"
    );

    server.shutdown().await.unwrap();
}

// =========================================================================
// Readiness signal
// =========================================================================

#[derive(Clone, Default)]
struct ReadinessEvents(Arc<Mutex<Vec<HashMap<String, String>>>>);

struct FieldCollector<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldCollector<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }
}

impl<S: Subscriber> Layer<S> for ReadinessEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() == READINESS_TARGET {
            let mut fields = HashMap::new();
            event.record(&mut FieldCollector(&mut fields));
            self.0.lock().unwrap().push(fields);
        }
    }
}

#[tokio::test]
async fn exactly_one_readiness_event() {
    let events = ReadinessEvents::default();
    let subscriber = tracing_subscriber::registry().with(events.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let server = Bootstrap::new(Ready, DefaultRoutes::new(Ready), MessageSocket)
        .start(env(0, &[]))
        .await
        .unwrap();

    // Traffic after readiness must not emit it again.
    reqwest::get(http_url(&server, "/api/health")).await.unwrap();

    let recorded = events.0.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    let fields = recorded.first().unwrap();
    assert_eq!(fields["base_url"], server.base_url());
    assert_eq!(fields["test_page"], format!("{}/test-ws", server.base_url()));

    server.shutdown().await.unwrap();
}
