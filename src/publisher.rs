//! State/event fan-out for connection observers.
//!
//! DESIGN
//! ======
//! Two channels, both non-blocking from the lifecycle manager's side:
//! - a `watch` holding the current `ConnectionState` — late observers read
//!   the present value, not a replay of transitions;
//! - a `broadcast` of `ClientEvent` — at-least-once, in emission order, to
//!   every registered receiver. A slow receiver lags and drops its oldest
//!   events; it never stalls heartbeat or message decode. Registration and
//!   drop are just `subscribe()` and `Drop`, safe concurrently with delivery.

use tokio::sync::{broadcast, watch};

use crate::message::{ChatMessage, ConnectionState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// EVENTS
// =============================================================================

/// What observers see: state transitions and newly arrived messages.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// `foreground` records whether the consuming surface was active when the
    /// message arrived.
    MessageReceived { message: ChatMessage, foreground: bool },
}

// =============================================================================
// PUBLISHER
// =============================================================================

pub struct EventPublisher {
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl EventPublisher {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { state_tx, events_tx }
    }

    /// Record a state transition and notify observers. No receivers is fine.
    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        let _ = self.events_tx.send(ClientEvent::StateChanged(state));
    }

    /// Publish a newly arrived message.
    pub fn message_received(&self, message: ChatMessage, foreground: bool) {
        let _ = self
            .events_tx
            .send(ClientEvent::MessageReceived { message, foreground });
    }

    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe the connection state as a live value.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Register an observer for the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "publisher_test.rs"]
mod tests;
