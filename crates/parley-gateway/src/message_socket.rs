//! Default message-domain handlers for the real-time transport.
//!
//! | Event | Payload | Effect |
//! |-------|---------|--------|
//! | `message` | `{"text": string}` | broadcast `message` to every client |
//! | `ping` | any | reply `pong` with the same payload |

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::realtime::{
    Connection, Dispatch, Envelope, RealtimeError, RealtimeInitializer, RealtimeServer,
};

/// Event carrying a chat message, both inbound and broadcast.
pub const MESSAGE_EVENT: &str = "message";

/// Liveness check event.
pub const PING_EVENT: &str = "ping";

/// Reply to [`PING_EVENT`].
pub const PONG_EVENT: &str = "pong";

/// Longest accepted message text, in characters.
const MAX_TEXT_CHARS: usize = 4_000;

/// Registers the `message` and `ping` handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageSocket;

impl RealtimeInitializer for MessageSocket {
    fn init(&self, server: &mut RealtimeServer) {
        server.on(MESSAGE_EVENT, on_message);
        server.on(PING_EVENT, |_, data| {
            Ok(Dispatch::Reply(Envelope::new(PONG_EVENT, data)))
        });
        tracing::debug!(events = ?server.events(), "Message socket handlers registered");
    }
}

fn on_message(connection: &Connection, data: Value) -> Result<Dispatch, RealtimeError> {
    let text = data
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RealtimeError::InvalidPayload(String::from("expected non-empty \"text\"")))?;

    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(RealtimeError::InvalidPayload(format!(
            "text exceeds {MAX_TEXT_CHARS} characters"
        )));
    }

    Ok(Dispatch::Broadcast(Envelope::new(
        MESSAGE_EVENT,
        json!({
            "id": Uuid::now_v7(),
            "from": connection.id,
            "text": text,
            "sent_at": Utc::now(),
        }),
    )))
}
