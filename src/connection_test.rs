use super::*;
use crate::client::{ChatClient, ClientOptions};
use crate::message::Direction;
use crate::publisher::ClientEvent;
use crate::store::test_helpers::memory_store;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;

const WAIT: Duration = Duration::from_secs(2);
/// Long enough that no heartbeat fires inside a test unless asked for.
const QUIET_HEARTBEAT: Duration = Duration::from_secs(60);

type ServerWs = WebSocketStream<TcpStream>;

// =============================================================================
// HARNESS
// =============================================================================

async fn bind() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port().to_string();
    let config = ConnectionConfig {
        host: "127.0.0.1".into(),
        port,
        display_name: "You".into(),
    };
    (listener, config)
}

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");
    timeout(WAIT, accept_async(stream))
        .await
        .expect("handshake timed out")
        .expect("handshake failed")
}

fn test_client(
    store: MessageStore,
    heartbeat_interval: Duration,
    notifier: Option<Arc<dyn NotificationSink>>,
) -> ChatClient {
    ChatClient::with_options(store, notifier, ClientOptions { heartbeat_interval })
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .expect("state channel closed");
}

async fn recv_text(ws: &mut ServerWs) -> String {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("frame timed out")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_message_event(rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>) -> (ChatMessage, bool) {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed");
        if let ClientEvent::MessageReceived { message, foreground } = event {
            return (message, foreground);
        }
    }
}

async fn drain_until_closed(ws: &mut ServerWs) {
    loop {
        match timeout(WAIT, ws.next()).await.expect("close timed out") {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }
}

fn is_heartbeat(raw: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return false;
    };
    value["type"] == "system"
        && value["event"] == "heartbeat"
        && value["request_id"] == protocol::HEARTBEAT_REQUEST_ID
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[tokio::test]
async fn connect_reaches_connected() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let _server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;
}

#[tokio::test]
async fn server_drop_after_open_ends_failed_and_reconnect_is_accepted() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    // Abrupt TCP teardown, no close handshake: transport failure.
    drop(server);
    wait_for_state(&mut state, ConnectionState::Failed).await;

    // FAILED is terminal only until the next external connect.
    let (listener, config) = bind().await;
    client.connect(config);
    let _server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;
}

#[tokio::test]
async fn dial_failure_reaches_failed() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    drop(listener);
    let mut state = client.state();

    client.connect(config);
    wait_for_state(&mut state, ConnectionState::Failed).await;
}

#[tokio::test]
async fn graceful_server_close_reaches_disconnected() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    server.close(None).await.expect("server close");
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn disconnect_sends_normal_closure() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    client.disconnect();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    drain_until_closed(&mut server).await;
}

// =============================================================================
// SESSION SUPERSESSION
// =============================================================================

#[tokio::test]
async fn second_connect_before_open_supersedes_first() {
    let store = memory_store().await;
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    // Listener A is never accepted: session A stays mid-handshake until it is
    // torn down by the second connect.
    let (_listener_a, config_a) = bind().await;
    let (listener_b, config_b) = bind().await;
    let mut state = client.state();

    client.connect(config_a);
    client.connect(config_b);

    let mut server_b = accept_ws(&listener_b).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    // Exactly one live session: traffic flows over B.
    client.send("hello");
    let frame = recv_text(&mut server_b).await;
    let value: Value = serde_json::from_str(&frame).expect("valid frame");
    assert_eq!(value["payload"]["content"], "hello");

    // The abandoned dial never disturbed the active session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn reconnect_closes_previous_session() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener_a, config_a) = bind().await;
    let (listener_b, config_b) = bind().await;
    let mut state = client.state();

    client.connect(config_a);
    let mut server_a = accept_ws(&listener_a).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let mut events = client.subscribe_events();
    client.connect(config_b);
    let mut server_b = accept_ws(&listener_b).await;

    // The new attempt walks CONNECTING → CONNECTED; broadcast preserves both.
    for want in [ConnectionState::Connecting, ConnectionState::Connected] {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed");
        let ClientEvent::StateChanged(state) = event else {
            panic!("expected state event, got {event:?}");
        };
        assert_eq!(state, want);
    }

    // The superseded session was released with a normal closure.
    drain_until_closed(&mut server_a).await;

    client.send("routed");
    let frame = recv_text(&mut server_b).await;
    let value: Value = serde_json::from_str(&frame).expect("valid frame");
    assert_eq!(value["payload"]["content"], "routed");
}

// =============================================================================
// SEND PATH
// =============================================================================

#[tokio::test]
async fn send_while_disconnected_is_a_noop() {
    let store = memory_store().await;
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    let mut events = client.subscribe_events();

    client.send("hello");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(store.list_all().await.unwrap().is_empty());
    assert_eq!(client.current_state(), ConnectionState::Disconnected);
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn sent_message_reaches_wire_and_store() {
    let store = memory_store().await;
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();
    let mut feed = store.subscribe();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    client.send("hi there");

    let frame = recv_text(&mut server).await;
    let value: Value = serde_json::from_str(&frame).expect("valid frame");
    assert_eq!(value["type"], "chat");
    assert_eq!(value["event"], "message");
    assert_eq!(value["payload"]["content"], "hi there");
    assert_eq!(value["payload"]["sender"], "You");
    assert!(value["payload"]["msg_id"].is_string());

    timeout(WAIT, feed.changed())
        .await
        .expect("feed emission timed out")
        .expect("feed closed");
    let snapshot = feed.borrow().clone();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].direction, Direction::Sent);
    assert_eq!(snapshot[0].sender, "You");
    assert_eq!(snapshot[0].content, "hi there");
    assert_eq!(snapshot[0].kind.as_deref(), Some("chat"));
}

#[tokio::test]
async fn msg_ids_differ_across_sends() {
    let client = test_client(memory_store().await, QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    client.send("one");
    client.send("two");

    let first: Value = serde_json::from_str(&recv_text(&mut server).await).unwrap();
    let second: Value = serde_json::from_str(&recv_text(&mut server).await).unwrap();
    assert_ne!(first["payload"]["msg_id"], second["payload"]["msg_id"]);
}

// =============================================================================
// INBOUND PATH
// =============================================================================

#[tokio::test]
async fn inbound_text_is_persisted_and_published() {
    let store = memory_store().await;
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let mut events = client.subscribe_events();
    let raw = r#"{"type":"chat","event":"message","payload":{"content":"hi","sender":"Alice"}}"#;
    server.send(Message::Text(raw.into())).await.expect("server send");

    let (message, foreground) = next_message_event(&mut events).await;
    assert!(foreground);
    assert_eq!(message.sender, "Alice");
    assert_eq!(message.content, "hi");
    assert_eq!(message.direction, Direction::Received);
    assert!(message.id > 0, "published message carries the store-assigned id");

    let all = store.list_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].sender, "Alice");
}

#[tokio::test]
async fn malformed_inbound_is_still_delivered() {
    let store = memory_store().await;
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let mut events = client.subscribe_events();
    server
        .send(Message::Text("definitely not json".into()))
        .await
        .expect("server send");

    let (message, _) = next_message_event(&mut events).await;
    assert_eq!(message.sender, "Server");
    assert_eq!(message.content, "definitely not json");
    assert!(message.kind.is_none());
}

#[tokio::test]
async fn binary_inbound_is_described_not_decoded() {
    let store = memory_store().await;
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let mut events = client.subscribe_events();
    server
        .send(Message::Binary(vec![1, 2, 3].into()))
        .await
        .expect("server send");

    let (message, _) = next_message_event(&mut events).await;
    assert_eq!(message.content, "received binary message (3 bytes)");
    assert_eq!(message.event.as_deref(), Some("binary"));
}

#[tokio::test]
async fn inbound_is_delivered_even_when_persist_fails() {
    let pool = crate::db::init_memory_pool().await;
    let store = MessageStore::open(pool.clone()).await.expect("store opens");
    let client = test_client(store.clone(), QUIET_HEARTBEAT, None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    // Sabotage the storage layer underneath the live connection: every insert
    // from here on fails.
    sqlx::query("DROP TABLE messages")
        .execute(&pool)
        .await
        .expect("drop table");

    let mut events = client.subscribe_events();
    let raw = r#"{"type":"chat","payload":{"content":"still delivered","sender":"Alice"}}"#;
    server.send(Message::Text(raw.into())).await.expect("server send");

    // The in-memory event is not suppressed by the failed insert; with no
    // store-assigned id the message keeps its zero placeholder.
    let (message, _) = next_message_event(&mut events).await;
    assert_eq!(message.sender, "Alice");
    assert_eq!(message.content, "still delivered");
    assert_eq!(message.id, 0);
    assert!(store.list_all().await.is_err(), "the table really is gone");

    // The connection itself is unaffected.
    assert_eq!(client.current_state(), ConnectionState::Connected);
}

// =============================================================================
// NOTIFICATION BOUNDARY
// =============================================================================

struct ChannelSink(mpsc::UnboundedSender<(String, String)>);

#[async_trait::async_trait]
impl NotificationSink for ChannelSink {
    async fn notify_new_message(&self, sender: &str, content: &str) {
        let _ = self.0.send((sender.to_string(), content.to_string()));
    }
}

#[tokio::test]
async fn backgrounded_messages_invoke_notifier() {
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
    let store = memory_store().await;
    let client = test_client(store, QUIET_HEARTBEAT, Some(Arc::new(ChannelSink(sink_tx))));
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    client.set_foreground(false);
    let raw = r#"{"type":"chat","payload":{"content":"psst","sender":"Alice"}}"#;
    server.send(Message::Text(raw.into())).await.expect("server send");

    let (sender, content) = timeout(WAIT, sink_rx.recv())
        .await
        .expect("notification timed out")
        .expect("sink channel closed");
    assert_eq!(sender, "Alice");
    assert_eq!(content, "psst");

    // Foreground messages bypass the sink entirely.
    let mut events = client.subscribe_events();
    client.set_foreground(true);
    let raw = r#"{"type":"chat","payload":{"content":"seen live","sender":"Alice"}}"#;
    server.send(Message::Text(raw.into())).await.expect("server send");
    let (_, foreground) = next_message_event(&mut events).await;
    assert!(foreground);
    assert!(
        timeout(Duration::from_millis(200), sink_rx.recv()).await.is_err(),
        "no notification expected while foregrounded"
    );
}

// =============================================================================
// HEARTBEAT
// =============================================================================

#[tokio::test]
async fn heartbeat_fires_per_interval_and_stops_after_disconnect() {
    let client = test_client(memory_store().await, Duration::from_millis(50), None);
    let (listener, config) = bind().await;
    let mut state = client.state();

    client.connect(config);
    let mut server = accept_ws(&listener).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    for _ in 0..3 {
        let frame = recv_text(&mut server).await;
        assert!(is_heartbeat(&frame), "expected heartbeat, got: {frame}");
    }

    client.disconnect();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    // Stragglers queued before teardown may still drain, then the session
    // closes and the stream ends — no heartbeat loop survives its session.
    drain_until_closed(&mut server).await;
    let after = timeout(Duration::from_millis(250), server.next()).await;
    assert!(matches!(after, Err(_) | Ok(None)), "expected silence after close, got {after:?}");
}
