//! Core chat types shared across the crate.
//!
//! DESIGN
//! ======
//! `ChatMessage` is the one unit the whole pipeline agrees on: the codec
//! produces it, the store persists it, the publisher fans it out. Messages are
//! append-only — once stored they are never mutated, only cleared wholesale.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// DIRECTION
// =============================================================================

/// Whether a message left this client or arrived from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    /// Stable text form used as the database column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    /// Parse the database column value. Unknown text maps to `Received` so a
    /// damaged row still renders as an inbound message instead of erroring.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Direction::Sent,
            _ => Direction::Received,
        }
    }
}

// =============================================================================
// CHAT MESSAGE
// =============================================================================

/// One exchanged chat unit, as persisted in the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Store-assigned rowid. Zero until the message has been inserted.
    pub id: i64,
    pub sender: String,
    pub content: String,
    /// Milliseconds since Unix epoch, stamped when the content leaves/arrives.
    pub timestamp: i64,
    pub direction: Direction,
    /// Envelope type: "system" / "chat" / "rpc" / "error".
    pub kind: Option<String>,
    /// Event name within the envelope type.
    pub event: Option<String>,
    /// Links a request to its response.
    pub correlation_id: Option<String>,
}

impl ChatMessage {
    /// Build an outbound chat message, stamped with the current time.
    #[must_use]
    pub fn sent(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            sender: sender.into(),
            content: content.into(),
            timestamp: now_ms(),
            direction: Direction::Sent,
            kind: Some("chat".into()),
            event: None,
            correlation_id: None,
        }
    }
}

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Connection lifecycle states. Owned exclusively by the lifecycle manager;
/// everything else only observes transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

// =============================================================================
// CONNECTION CONFIG
// =============================================================================

/// Connection target, supplied externally at connect time. Treated as an
/// immutable snapshot per attempt — a later attempt may supply new values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: String,
    pub display_name: String,
}

impl ConnectionConfig {
    /// WebSocket URL for this target.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

// =============================================================================
// TESTS
// =============================================================================
