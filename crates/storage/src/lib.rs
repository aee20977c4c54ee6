use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{MessageId, MessageStatus, RecipientKey, UserId};

/// A message as handed to the store for creation. The store assigns the id
/// and the creation time; new records always start out `sent`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub keys: Vec<RecipientKey>,
    pub expires_at: DateTime<Utc>,
    pub attachments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub keys: Vec<RecipientKey>,
    pub status: MessageStatus,
    pub expires_at: DateTime<Utc>,
    pub attachments: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistence port used by the relay.
///
/// `save` is conditional: it only writes when the stored status still equals
/// `expected`, which is what serializes racing status transitions for the
/// same message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: &NewMessage) -> Result<MessageId>;

    async fn get_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>>;

    /// Returns `false` when the stored status no longer matched `expected`.
    /// Only the status column is written.
    async fn save(&self, message: &StoredMessage, expected: MessageStatus) -> Result<bool>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own empty database,
        // so in-memory stores are pinned to one long-lived connection.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn count_messages(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn load_keys(&self, message_id: MessageId) -> Result<Vec<RecipientKey>> {
        let rows = sqlx::query(
            "SELECT recipient_id, encrypted_key FROM message_keys
             WHERE message_id = ?
             ORDER BY rowid ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| RecipientKey {
                recipient_id: UserId(r.get::<i64, _>(0)),
                encrypted_key: r.get::<String, _>(1),
            })
            .collect())
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn create(&self, message: &NewMessage) -> Result<MessageId> {
        let mut tx = self.pool.begin().await?;

        let rec = sqlx::query(
            "INSERT INTO messages
                (sender_id, receiver_id, content, status, expires_at_ms, attachments, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.sender_id.0)
        .bind(message.receiver_id.0)
        .bind(&message.content)
        .bind(MessageStatus::Sent.as_str())
        .bind(message.expires_at.timestamp_millis())
        .bind(message.attachments.as_deref())
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        for key in &message.keys {
            sqlx::query(
                "INSERT INTO message_keys (message_id, recipient_id, encrypted_key)
                 VALUES (?, ?, ?)",
            )
            .bind(message_id.0)
            .bind(key.recipient_id.0)
            .bind(&key.encrypted_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(message_id)
    }

    async fn get_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, content, status, expires_at_ms, attachments,
                    created_at_ms
             FROM messages
             WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let keys = self.load_keys(message_id).await?;
        message_from_row(&row, keys).map(Some)
    }

    async fn save(&self, message: &StoredMessage, expected: MessageStatus) -> Result<bool> {
        let updated = sqlx::query("UPDATE messages SET status = ? WHERE id = ? AND status = ?")
            .bind(message.status.as_str())
            .bind(message.message_id.0)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM message_keys
             WHERE message_id IN (SELECT id FROM messages WHERE expires_at_ms <= ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM messages WHERE expires_at_ms <= ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }
}

fn message_from_row(row: &SqliteRow, keys: Vec<RecipientKey>) -> Result<StoredMessage> {
    let message_id = MessageId(row.get::<i64, _>(0));
    let raw_status = row.get::<String, _>(4);
    let status = MessageStatus::parse(&raw_status)
        .ok_or_else(|| anyhow!("message {message_id} has unknown status '{raw_status}'"))?;

    Ok(StoredMessage {
        message_id,
        sender_id: UserId(row.get::<i64, _>(1)),
        receiver_id: UserId(row.get::<i64, _>(2)),
        content: row.get::<String, _>(3),
        keys,
        status,
        expires_at: millis_to_datetime(row.get::<i64, _>(5))?,
        attachments: row.get::<Option<String>, _>(6),
        created_at: millis_to_datetime(row.get::<i64, _>(7))?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow!("timestamp {millis} out of range"))
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
