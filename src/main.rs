//! rechat — a background chat client with durable history.
//!
//! The terminal front end here is deliberately thin: it wires the store and
//! client together, prints events, and forwards stdin lines. Everything with
//! real behavior lives in the library modules.

mod client;
mod connection;
mod db;
mod message;
mod notify;
mod protocol;
mod publisher;
mod store;

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::{error, warn};

use crate::client::ChatClient;
use crate::message::ConnectionConfig;
use crate::publisher::ClientEvent;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let _ = dotenvy::dotenv();

    let database_url = env_or("DATABASE_URL", "sqlite:rechat.db");
    let config = ConnectionConfig {
        host: env_or("CHAT_HOST", "127.0.0.1"),
        port: env_or("CHAT_PORT", "12345"),
        display_name: env_or("CHAT_NAME", "You"),
    };

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");
    let store = store::MessageStore::open(pool)
        .await
        .expect("message store init failed");
    let client = ChatClient::new(store, Some(Arc::new(notify::LogNotifier)));

    // Print state transitions and arriving messages.
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::StateChanged(state)) => println!("* connection {state:?}"),
                Ok(ClientEvent::MessageReceived { message, .. }) => {
                    println!("{}: {}", message.sender, message.content);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    client.connect(config.clone());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "/quit" => break,
            "/connect" => client.connect(config.clone()),
            "/disconnect" => client.disconnect(),
            "/background" => client.set_foreground(false),
            "/foreground" => client.set_foreground(true),
            "/clear" => {
                if let Err(e) = client.clear_history().await {
                    error!(error = %e, "failed to clear history");
                }
            }
            "/export" => match client.export_transcript().await {
                Ok(transcript) => print!("{transcript}"),
                Err(e) => error!(error = %e, "failed to export transcript"),
            },
            "" => {}
            text => client.send(text),
        }
    }

    client.disconnect();
}
