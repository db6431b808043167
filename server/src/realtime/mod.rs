//! WebSocket session protocol: ingest (producer) and subscriber (consumer)
//! sides, plus the frame-level helpers both share.
//!
//! Application messages are always text frames. Control frames cap their
//! payload at 125 bytes, so close reasons are clipped to 123 UTF-8 bytes.

pub mod ingest;
pub mod subscriber;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Deserialize;
use tracing::debug;

use crate::models::RelayMessage;

/// Close codes used by the relay.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;
    pub const PROTOCOL_VIOLATION: u16 = 4000;
    pub const AUTH_FAILED: u16 = 4001;
    pub const INGEST_EXISTS: u16 = 4002;
    pub const SUBSCRIBER_LIMIT: u16 = 4003;
}

/// Query parameters accepted on both WebSocket endpoints.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub source: Option<String>,
}

/// Clips to at most `max` bytes without splitting a UTF-8 sequence.
fn clip_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Close reasons ride in a control frame and must stay within 123 bytes.
pub fn clip_reason(reason: &str) -> &str {
    clip_utf8(reason, 123)
}

/// Sends a close frame with a clipped reason; errors are ignored because the
/// peer may already be gone.
pub(crate) async fn close_socket(
    sender: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) {
    let frame = CloseFrame {
        code,
        reason: clip_reason(reason).to_string().into(),
    };
    if sender.send(Message::Close(Some(frame))).await.is_err() {
        debug!(code, "close frame not delivered, peer already gone");
    }
}

/// Serializes an envelope for a text frame, truncating oversized payloads.
///
/// Envelopes above `cap` bytes get their `text` field clipped and a
/// `"_truncated":true` marker so subscribers can tell the payload is
/// incomplete.
pub fn encode_envelope(msg: &RelayMessage, cap: usize) -> String {
    let serialized = match serde_json::to_string(msg) {
        Ok(s) => s,
        Err(_) => return "{}".to_string(),
    };
    if serialized.len() <= cap {
        return serialized;
    }

    let mut value = match serde_json::to_value(msg) {
        Ok(serde_json::Value::Object(obj)) => obj,
        _ => return serialized,
    };

    // Transcript envelopes carry their bulk in `text`, status envelopes in
    // `message`; clip whichever is present.
    let field = if value.contains_key("text") {
        "text"
    } else {
        "message"
    };
    let overhead = value
        .get(field)
        .and_then(|t| t.as_str())
        .map(|t| serialized.len() - t.len())
        .unwrap_or(serialized.len());
    // Marker plus JSON punctuation need headroom of their own.
    let budget = cap.saturating_sub(overhead + 32);
    if let Some(serde_json::Value::String(body)) = value.get_mut(field) {
        *body = clip_utf8(body, budget).to_string();
    }
    value.insert("_truncated".to_string(), serde_json::Value::Bool(true));

    serde_json::to_string(&value).unwrap_or(serialized)
}
