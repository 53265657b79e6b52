//! Connection lifecycle manager — socket ownership, state machine, heartbeat.
//!
//! ARCHITECTURE
//! ============
//! One background task owns everything: it consumes a command channel from the
//! client facade and a transport event channel fed by per-session socket
//! tasks. Transport callbacks are modeled as a tagged event stream (`Opened`,
//! `Text`, `Binary`, `Closed`, `Failed`) so all state lives in one
//! single-threaded loop instead of scattered mutable fields.
//!
//! Every event is tagged with the id of the session that produced it. A new
//! session's events may start flowing before the old session's final event has
//! been observed; events whose tag does not match the current session are
//! discarded, so a slow late callback from a superseded session can never
//! corrupt current state.
//!
//! LIFECYCLE
//! =========
//! 1. `Connect` → tear down any prior session FIRST, then CONNECTING and dial
//! 2. `Opened` → CONNECTED, heartbeat task starts (scoped to this session)
//! 3. `Failed` → FAILED, terminal until the next external `Connect`
//! 4. `Closed` (graceful) → DISCONNECTED
//!
//! There is deliberately no automatic reconnect or backoff: FAILED is surfaced
//! to observers and a supervising caller decides when to retry.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{ChatMessage, ConnectionConfig, ConnectionState};
use crate::notify::NotificationSink;
use crate::protocol::{self, MsgIds};
use crate::publisher::EventPublisher;
use crate::store::MessageStore;

/// Heartbeat cadence while a session is CONNECTED.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// COMMANDS AND EVENTS
// =============================================================================

/// Instructions from the client facade to the manager task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect(ConnectionConfig),
    Send(String),
    Disconnect,
}

/// Transport callbacks, normalized into a tagged union.
#[derive(Debug)]
enum TransportEvent {
    Opened,
    Text(String),
    Binary(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    Failed(String),
}

// =============================================================================
// SESSION
// =============================================================================

/// One underlying socket, from dial to close/failure. Heartbeats and message
/// traffic are scoped to the currently active session.
struct Session {
    id: Uuid,
    display_name: String,
    /// Outgoing frames for the socket task. Dropping this sender tells the
    /// task to perform a normal closure.
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    msg_ids: MsgIds,
    /// Set once `Opened` has been observed for this session.
    opened: bool,
}

// =============================================================================
// SPAWN
// =============================================================================

/// Spawn the manager task. Returns the command sender; the task ends when the
/// last sender is dropped.
pub(crate) fn spawn_manager(
    store: MessageStore,
    publisher: Arc<EventPublisher>,
    notifier: Option<Arc<dyn NotificationSink>>,
    foreground: watch::Receiver<bool>,
    heartbeat_interval: Duration,
) -> mpsc::UnboundedSender<Command> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let manager = Manager {
        store,
        publisher,
        notifier,
        foreground,
        heartbeat_interval,
        event_tx,
        session: None,
    };
    tokio::spawn(manager.run(command_rx, event_rx));

    command_tx
}

// =============================================================================
// MANAGER
// =============================================================================

struct Manager {
    store: MessageStore,
    publisher: Arc<EventPublisher>,
    notifier: Option<Arc<dyn NotificationSink>>,
    /// Whether the consuming surface is currently active. Read at message
    /// arrival; replaces the original design's process-wide foreground flag.
    foreground: watch::Receiver<bool>,
    heartbeat_interval: Duration,
    event_tx: mpsc::UnboundedSender<(Uuid, TransportEvent)>,
    session: Option<Session>,
}

impl Manager {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(Uuid, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Client facade dropped: shut the session down and exit.
                        self.teardown_session();
                        break;
                    }
                },
                event = events.recv() => {
                    // Never `None`: the manager keeps a sender clone for new sessions.
                    if let Some((session_id, event)) = event {
                        self.handle_transport_event(session_id, event).await;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // COMMANDS
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(config) => self.connect(config),
            Command::Send(text) => self.send_chat(&text).await,
            Command::Disconnect => {
                self.teardown_session();
                self.publisher.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Cancel any prior attempt/session first, then open a new transport
    /// session. Valid from every state, FAILED included.
    fn connect(&mut self, config: ConnectionConfig) {
        self.teardown_session();

        let id = Uuid::new_v4();
        let url = config.url();
        info!(session = %id, %url, "connecting");
        self.publisher.set_state(ConnectionState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(id, url, outbound_rx, self.event_tx.clone()));

        self.session = Some(Session {
            id,
            display_name: config.display_name,
            outbound: outbound_tx,
            task,
            heartbeat: None,
            msg_ids: MsgIds::new(),
            opened: false,
        });
    }

    /// Send chat text. Valid only while CONNECTED; otherwise the text is
    /// dropped, not queued — an explicit simplification, not an error.
    async fn send_chat(&self, text: &str) {
        let connected = self.publisher.current_state() == ConnectionState::Connected;
        let Some(session) = self.session.as_ref().filter(|_| connected) else {
            debug!("send while not connected; dropping message");
            return;
        };

        let frame = protocol::encode_chat(
            text,
            &session.display_name,
            protocol::CHAT_EVENT,
            &session.msg_ids.next(),
        );
        if session.outbound.send(Message::Text(frame.into())).is_err() {
            warn!("session outbound channel closed; dropping message");
            return;
        }

        // Persist the outgoing message. A storage failure is logged and does
        // not affect the connection.
        let message = ChatMessage::sent(session.display_name.clone(), text);
        if let Err(e) = self.store.insert(&message).await {
            warn!(error = %e, "failed to persist sent message");
        }
    }

    /// Abort the heartbeat and release the socket. A session that has opened
    /// is closed normally (the socket task sends a close frame once its
    /// outbound channel drops); one still dialing is aborted outright.
    fn teardown_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(heartbeat) = session.heartbeat {
            heartbeat.abort();
        }
        if session.opened {
            drop(session.outbound);
        } else {
            session.task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // TRANSPORT EVENTS
    // -------------------------------------------------------------------------

    async fn handle_transport_event(&mut self, session_id: Uuid, event: TransportEvent) {
        let current = self.session.as_ref().map(|s| s.id);
        if current != Some(session_id) {
            debug!(session = %session_id, ?event, "discarding event from stale session");
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Text(text) => self.deliver_inbound(protocol::decode_text(&text)).await,
            TransportEvent::Binary(bytes) => {
                self.deliver_inbound(protocol::decode_binary(&bytes)).await;
            }
            TransportEvent::Closed { code, reason } => {
                info!(session = %session_id, ?code, %reason, "connection closed");
                self.teardown_session();
                self.publisher.set_state(ConnectionState::Disconnected);
            }
            TransportEvent::Failed(error) => {
                warn!(session = %session_id, %error, "transport failure");
                self.teardown_session();
                self.publisher.set_state(ConnectionState::Failed);
            }
        }
    }

    fn on_opened(&mut self) {
        let interval = self.heartbeat_interval;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.opened = true;
        info!(session = %session.id, "connection open");
        self.publisher.set_state(ConnectionState::Connected);

        if session.heartbeat.is_none() {
            let outbound = session.outbound.clone();
            session.heartbeat = Some(tokio::spawn(run_heartbeat(outbound, interval)));
        }
    }

    /// Decode result → persist → publish → notify (when backgrounded). A
    /// failed persist must not suppress the in-memory event.
    async fn deliver_inbound(&mut self, decoded: protocol::Decoded) {
        let mut message = decoded.into_message();
        match self.store.insert(&message).await {
            Ok(id) => message.id = id,
            Err(e) => {
                warn!(error = %e, "failed to persist inbound message; delivering in-memory event only");
            }
        }

        let foreground = *self.foreground.borrow();
        self.publisher.message_received(message.clone(), foreground);

        if !foreground {
            if let Some(notifier) = &self.notifier {
                // Fire-and-forget: a slow sink must not stall the event loop.
                let notifier = Arc::clone(notifier);
                tokio::spawn(async move {
                    notifier
                        .notify_new_message(&message.sender, &message.content)
                        .await;
                });
            }
        }
    }
}

// =============================================================================
// HEARTBEAT
// =============================================================================

/// Push one heartbeat frame per interval into the session's outbound channel.
/// A send failure here is swallowed — the transport's own failure event is the
/// authoritative signal, and this loop is aborted when its session ends.
async fn run_heartbeat(outbound: mpsc::UnboundedSender<Message>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of `interval` fires immediately; consume it so the first
    // heartbeat goes out one full interval after connect.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = Message::Text(protocol::heartbeat_frame().into());
        if outbound.send(frame).is_err() {
            break;
        }
    }
}

// =============================================================================
// SOCKET TASK
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Own one socket from dial to termination, translating traffic into tagged
/// transport events. Sends on the event channel are best-effort: if the
/// manager is gone there is nobody left to care.
async fn run_session(
    id: Uuid,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<(Uuid, TransportEvent)>,
) {
    let ws: WsStream = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send((id, TransportEvent::Failed(e.to_string())));
            return;
        }
    };
    let _ = events.send((id, TransportEvent::Opened));

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        let _ = events.send((id, TransportEvent::Failed(e.to_string())));
                        return;
                    }
                }
                None => {
                    // Manager released the session: normal closure.
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    }));
                    let _ = sink.send(close).await;
                    return;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send((id, TransportEvent::Text(text.to_string())));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send((id, TransportEvent::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let _ = events.send((id, TransportEvent::Closed { code, reason }));
                    return;
                }
                // Ping/pong are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send((id, TransportEvent::Failed(e.to_string())));
                    return;
                }
                None => {
                    let _ = events.send((id, TransportEvent::Closed { code: None, reason: String::new() }));
                    return;
                }
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
