//! Handlers for the default route table.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::{Extension, Json};
use chrono::Utc;
use parley_db::PersistenceConnector;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::body::DecodedBody;
use crate::client_addr::ClientAddr;
use crate::error::ApiError;
use crate::message_socket::MESSAGE_EVENT;
use crate::realtime::{DEFAULT_SOCKET_PATH, Envelope};
use crate::routes::RouteState;

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

/// Report liveness, persistence reachability, and socket usage.
///
/// Pings the backend on every call. A failed ping answers `503` with
/// `"status": "degraded"`.
pub async fn health<P>(State(state): State<Arc<RouteState<P>>>) -> (StatusCode, Json<Value>)
where
    P: PersistenceConnector + 'static,
{
    let uptime = Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds()
        .max(0);

    let reachable = match state.persistence.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(backend = state.persistence.name(), error = %e, "Persistence ping failed");
            false
        }
    };
    let (status, label) = if reachable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(json!({
            "status": label,
            "persistence": state.persistence.name(),
            "persistence_reachable": reachable,
            "connected_clients": state.broadcaster.connected_clients(),
            "started_at": state.started_at,
            "uptime_secs": uptime,
        })),
    )
}

// ---------------------------------------------------------------------------
// POST /api/messages
// ---------------------------------------------------------------------------

/// Broadcast a message posted over HTTP to every real-time client.
///
/// Accepts JSON or form bodies with a non-empty `text` field.
pub async fn post_message<P>(
    State(state): State<Arc<RouteState<P>>>,
    Extension(ClientAddr(client)): Extension<ClientAddr>,
    DecodedBody(body): DecodedBody,
) -> Result<impl IntoResponse, ApiError>
where
    P: Send + Sync + 'static,
{
    let text = body
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest(String::from("expected non-empty \"text\"")))?;

    let id = Uuid::now_v7();
    let delivered = state.broadcaster.emit(Envelope::new(
        MESSAGE_EVENT,
        json!({
            "id": id,
            "from": client.map(|ip| ip.to_string()),
            "text": text,
            "sent_at": Utc::now(),
        }),
    ));

    tracing::debug!(%id, delivered, "Message posted over HTTP");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "delivered": delivered })),
    ))
}

// ---------------------------------------------------------------------------
// GET /test-ws
// ---------------------------------------------------------------------------

/// Minimal page for poking the real-time socket from a browser.
pub async fn test_page() -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Parley socket test</title>
    <style>
        body {{ font-family: monospace; padding: 2rem; max-width: 720px; margin: 0 auto; }}
        #log {{ border: 1px solid #ccc; padding: 0.5rem; height: 320px; overflow-y: auto; }}
        .error {{ color: #b00; }}
    </style>
</head>
<body>
    <h1>Parley socket test</h1>
    <div id="log"></div>
    <form id="send">
        <input id="text" autocomplete="off" placeholder="say something" autofocus>
        <button>Send</button>
    </form>
    <script>
        const log = document.getElementById("log");
        const line = (text, cls) => {{
            const p = document.createElement("div");
            if (cls) p.className = cls;
            p.textContent = text;
            log.appendChild(p);
            log.scrollTop = log.scrollHeight;
        }};
        const scheme = location.protocol === "https:" ? "wss" : "ws";
        const ws = new WebSocket(`${{scheme}}://${{location.host}}{DEFAULT_SOCKET_PATH}`);
        ws.onopen = () => line("connected");
        ws.onclose = () => line("disconnected", "error");
        ws.onmessage = (e) => {{
            const env = JSON.parse(e.data);
            line(`${{env.event}}: ${{JSON.stringify(env.data)}}`, env.event === "error" ? "error" : "");
        }};
        document.getElementById("send").onsubmit = (e) => {{
            e.preventDefault();
            const input = document.getElementById("text");
            ws.send(JSON.stringify({{ event: "message", data: {{ text: input.value }} }}));
            input.value = "";
        }};
    </script>
</body>
</html>"#
    ))
}
