//! Durable message store — append-only chat history with a live feed.
//!
//! DESIGN
//! ======
//! Rows live in the SQLite `messages` table; readers and the connection
//! worker share one pool. The subscription feed is a `tokio::sync::watch`
//! channel holding the full ordered list: level-triggered, each emission is a
//! complete consistent snapshot, never a delta. Subscribers replace their view
//! wholesale on every emission, so a coalesced update loses nothing.
//!
//! ERROR HANDLING
//! ==============
//! Writes are single statements — all-or-nothing, a failure never corrupts
//! stored state. A refresh failure after a successful write is logged and
//! swallowed: the row is durable, the feed catches up on the next emission.

use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tracing::warn;

use crate::message::{ChatMessage, Direction};

// =============================================================================
// ERROR TYPE
// =============================================================================

/// Storage-layer failure. Callers decide severity: the lifecycle manager
/// treats a failed insert as non-fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

// =============================================================================
// MESSAGE STORE
// =============================================================================

/// Handle to the durable message table. Cheap to clone; all clones share the
/// pool and the subscription feed.
#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    pool: SqlitePool,
    feed: watch::Sender<Arc<Vec<ChatMessage>>>,
}

impl MessageStore {
    /// Open the store over an initialized pool and seed the feed with the
    /// current history.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial history scan fails.
    pub async fn open(pool: SqlitePool) -> Result<Self, StoreError> {
        let initial = list_all_rows(&pool).await?;
        let (feed, _) = watch::channel(Arc::new(initial));
        Ok(Self { inner: Arc::new(StoreInner { pool, feed }) })
    }

    /// Append one message and wake all active subscriptions. Returns the
    /// store-assigned id. Never rejects on content, only on storage failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert itself fails.
    pub async fn insert(&self, message: &ChatMessage) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (sender, content, timestamp, direction, kind, event, request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&message.sender)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(message.direction.as_str())
        .bind(&message.kind)
        .bind(&message.event)
        .bind(&message.correlation_id)
        .execute(&self.inner.pool)
        .await
        .map_err(StoreError::Db)?;

        self.refresh().await;
        Ok(result.last_insert_rowid())
    }

    /// Full ordered snapshot: ascending timestamp, ties broken by insertion
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan fails.
    pub async fn list_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        list_all_rows(&self.inner.pool).await
    }

    /// Delete all rows, then emit one empty snapshot to subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages")
            .execute(&self.inner.pool)
            .await
            .map_err(StoreError::Db)?;

        self.refresh().await;
        Ok(())
    }

    /// Subscribe to the live feed. The current snapshot is available
    /// immediately via `borrow()`; `changed()` resolves after every
    /// successful insert or clear.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<ChatMessage>>> {
        self.inner.feed.subscribe()
    }

    /// Re-scan the table and publish the snapshot. Failures are logged, not
    /// propagated: the underlying write already succeeded.
    async fn refresh(&self) {
        match list_all_rows(&self.inner.pool).await {
            Ok(list) => {
                self.inner.feed.send_replace(Arc::new(list));
            }
            Err(e) => warn!(error = %e, "message feed refresh failed"),
        }
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

async fn list_all_rows(pool: &SqlitePool) -> Result<Vec<ChatMessage>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, sender, content, timestamp, direction, kind, event, request_id
         FROM messages
         ORDER BY timestamp ASC, id ASC",
    )
    .fetch_all(pool)
    .await
    .map_err(StoreError::Db)?;

    Ok(rows.iter().map(row_to_message).collect())
}

fn row_to_message(row: &SqliteRow) -> ChatMessage {
    let direction: String = row.get("direction");
    ChatMessage {
        id: row.get("id"),
        sender: row.get("sender"),
        content: row.get("content"),
        timestamp: row.get("timestamp"),
        direction: Direction::parse(&direction),
        kind: row.get("kind"),
        event: row.get("event"),
        correlation_id: row.get("request_id"),
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
