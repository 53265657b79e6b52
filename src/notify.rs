//! Notification collaborator boundary.
//!
//! The core only decides *when* a message warrants a notification — a message
//! arriving while the consuming surface is not active. How it is surfaced
//! (toast, banner, desktop notification) is entirely the sink's business.

use async_trait::async_trait;

/// Receives `(sender, content)` pairs for messages that arrived while the
/// consuming surface was backgrounded.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_new_message(&self, sender: &str, content: &str);
}

/// Default sink for headless use: surfaces notifications through the log.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_new_message(&self, sender: &str, content: &str) {
        tracing::info!(sender, content, "message received while backgrounded");
    }
}
