//! Wire-protocol codec for the chat envelope.
//!
//! ARCHITECTURE
//! ============
//! Every frame on the wire is a JSON envelope:
//!
//! ```text
//! { "type": "system" | "chat" | "rpc" | "error",
//!   "event": "<event name>",
//!   "payload": { "content": string, "sender": string, "msg_id": string },
//!   "request_id": "<correlation id, optional>" }
//! ```
//!
//! DESIGN
//! ======
//! Decoding never fails. Anything that does not parse as an envelope with a
//! string `payload.content` is delivered verbatim as content from `"Server"`.
//! The lifecycle manager relies on this: there is no decode-error path to
//! special-case, every inbound frame yields a displayable message.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use crate::message::{ChatMessage, Direction, now_ms};

/// Fixed correlation token carried by every heartbeat frame.
pub const HEARTBEAT_REQUEST_ID: &str = "1024";

/// Default event name for outgoing chat frames.
pub const CHAT_EVENT: &str = "message";

// =============================================================================
// MSG IDS
// =============================================================================

/// Monotonic counter for outgoing `msg_id` tokens.
///
/// Uniqueness is only required within one connection session; the manager
/// creates a fresh counter per session.
#[derive(Debug)]
pub struct MsgIds(AtomicU64);

impl MsgIds {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Next unique token for this session.
    pub fn next(&self) -> String {
        self.0.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

impl Default for MsgIds {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ENCODE
// =============================================================================

/// Encode outgoing chat text into the wire envelope. Always `type=chat`;
/// content and sender are carried verbatim.
#[must_use]
pub fn encode_chat(content: &str, sender: &str, event: &str, msg_id: &str) -> String {
    json!({
        "type": "chat",
        "event": event,
        "payload": {
            "content": content,
            "sender": sender,
            "msg_id": msg_id,
        },
    })
    .to_string()
}

/// The periodic keepalive frame: `type=system, event=heartbeat` with a fixed
/// correlation token.
#[must_use]
pub fn heartbeat_frame() -> String {
    json!({
        "type": "system",
        "event": "heartbeat",
        "request_id": HEARTBEAT_REQUEST_ID,
    })
    .to_string()
}

// =============================================================================
// DECODE
// =============================================================================

/// Normalized result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub sender: String,
    pub content: String,
    pub kind: Option<String>,
    pub event: Option<String>,
    pub correlation_id: Option<String>,
}

impl Decoded {
    /// Fallback shape: the entire raw input as content from `"Server"`.
    fn raw(content: impl Into<String>) -> Self {
        Self {
            sender: "Server".into(),
            content: content.into(),
            kind: None,
            event: None,
            correlation_id: None,
        }
    }

    /// Convert into a `Received` message stamped with the current time.
    #[must_use]
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            id: 0,
            sender: self.sender,
            content: self.content,
            timestamp: now_ms(),
            direction: Direction::Received,
            kind: self.kind,
            event: self.event,
            correlation_id: self.correlation_id,
        }
    }
}

/// Decode an inbound text frame.
///
/// Structured parse first: if the top-level object parses and carries a string
/// `payload.content`, that is the content and `payload.sender` is the sender
/// (default `"Server"`). On any failure — malformed JSON, missing fields,
/// wrong types — the raw input becomes the content. This function never errors.
#[must_use]
pub fn decode_text(raw: &str) -> Decoded {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Decoded::raw(raw);
    };

    let payload = value.get("payload");
    let Some(content) = payload
        .and_then(|p| p.get("content"))
        .and_then(Value::as_str)
    else {
        return Decoded::raw(raw);
    };

    let sender = payload
        .and_then(|p| p.get("sender"))
        .and_then(Value::as_str)
        .unwrap_or("Server");

    // An envelope without an explicit type is still a chat message.
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("chat");

    Decoded {
        sender: sender.to_string(),
        content: content.to_string(),
        kind: Some(kind.to_string()),
        event: value.get("event").and_then(Value::as_str).map(String::from),
        correlation_id: value
            .get("request_id")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

/// Decode an inbound binary frame. Binary payloads are never interpreted as
/// text; the content is a synthetic size description.
#[must_use]
pub fn decode_binary(bytes: &[u8]) -> Decoded {
    Decoded {
        sender: "Server".into(),
        content: format!("received binary message ({} bytes)", bytes.len()),
        kind: Some("chat".into()),
        event: Some("binary".into()),
        correlation_id: None,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
