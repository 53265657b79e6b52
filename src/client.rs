//! Client facade — the surface the presentation layer talks to.
//!
//! DESIGN
//! ======
//! `ChatClient` wires the store, publisher, and connection manager together
//! and exposes only observables and fire-and-forget commands. Nothing here
//! blocks on the network: `connect`/`send`/`disconnect` enqueue a command for
//! the background worker and return immediately.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::{broadcast, mpsc, watch};

use crate::connection::{self, Command, HEARTBEAT_INTERVAL};
use crate::message::{ChatMessage, ConnectionConfig, ConnectionState};
use crate::notify::NotificationSink;
use crate::publisher::{ClientEvent, EventPublisher};
use crate::store::{MessageStore, StoreError};

/// Fixed transcript line produced when there is no history to export.
pub const NO_HISTORY_PLACEHOLDER: &str = "No chat history.";

// =============================================================================
// OPTIONS
// =============================================================================

/// Tuning knobs for the client. Defaults match production behavior; tests
/// shrink the heartbeat interval.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub heartbeat_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { heartbeat_interval: HEARTBEAT_INTERVAL }
    }
}

// =============================================================================
// CHAT CLIENT
// =============================================================================

pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    publisher: Arc<EventPublisher>,
    store: MessageStore,
    foreground_tx: watch::Sender<bool>,
}

impl ChatClient {
    #[must_use]
    pub fn new(store: MessageStore, notifier: Option<Arc<dyn NotificationSink>>) -> Self {
        Self::with_options(store, notifier, ClientOptions::default())
    }

    #[must_use]
    pub fn with_options(
        store: MessageStore,
        notifier: Option<Arc<dyn NotificationSink>>,
        options: ClientOptions,
    ) -> Self {
        let publisher = Arc::new(EventPublisher::new());
        let (foreground_tx, foreground_rx) = watch::channel(true);
        let commands = connection::spawn_manager(
            store.clone(),
            Arc::clone(&publisher),
            notifier,
            foreground_rx,
            options.heartbeat_interval,
        );
        Self { commands, publisher, store, foreground_tx }
    }

    // -------------------------------------------------------------------------
    // COMMANDS
    // -------------------------------------------------------------------------

    /// Open a connection to the given target, replacing any active session.
    pub fn connect(&self, config: ConnectionConfig) {
        let _ = self.commands.send(Command::Connect(config));
    }

    /// Send chat text. Fire-and-forget: while not CONNECTED the text is
    /// dropped, not queued — a documented simplification, not an error.
    /// Blank input is ignored.
    pub fn send(&self, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        let _ = self.commands.send(Command::Send(text));
    }

    /// Close the active session, if any, with a normal closure.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Tell the core whether the consuming surface is active. Messages that
    /// arrive while backgrounded are routed to the notification sink.
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground_tx.send_replace(foreground);
    }

    // -------------------------------------------------------------------------
    // OBSERVABLES
    // -------------------------------------------------------------------------

    /// Current connection state as an observable value.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.state()
    }

    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.publisher.current_state()
    }

    /// Register an observer for state transitions and new-message events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.publisher.subscribe()
    }

    /// Live ordered message list; see `MessageStore::subscribe`.
    #[must_use]
    pub fn subscribe_messages(&self) -> watch::Receiver<Arc<Vec<ChatMessage>>> {
        self.store.subscribe()
    }

    // -------------------------------------------------------------------------
    // HISTORY
    // -------------------------------------------------------------------------

    /// Delete all stored history.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails; the connection itself is
    /// unaffected.
    pub async fn clear_history(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    /// Flat timestamped transcript of the full history, one message per line.
    ///
    /// # Errors
    ///
    /// Returns an error if the history scan fails.
    pub async fn export_transcript(&self) -> Result<String, StoreError> {
        let messages = self.store.list_all().await?;
        Ok(render_transcript(&messages))
    }
}

// =============================================================================
// TRANSCRIPT
// =============================================================================

/// Render `[YYYY-MM-DD HH:MM:SS] sender: content` lines (UTC), newline
/// terminated. Empty history yields the fixed placeholder.
#[must_use]
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return NO_HISTORY_PLACEHOLDER.to_string();
    }

    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let mut out = String::new();
    for message in messages {
        let seconds = message.timestamp.div_euclid(1000);
        let time_str = OffsetDateTime::from_unix_timestamp(seconds)
            .ok()
            .and_then(|t| t.format(&format).ok())
            .unwrap_or_else(|| message.timestamp.to_string());
        let _ = writeln!(out, "[{time_str}] {}: {}", message.sender, message.content);
    }
    out
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
