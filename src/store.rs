use crate::{
    bus::{Event, EventBus},
    chat::{ConversationScope, FeedEvent, Message, MessageId},
    entity::{Profile, UserId},
    error::{SyncError, SyncResult},
    remote::{ChangeFeed, FeedStream, MessageLog, ProfileDirectory},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// SQLite-backed message log. Every committed change is published on the
/// event bus, which is what [`ChangeFeed`] subscribers read from.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    bus: Arc<EventBus>,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>, bus: Arc<EventBus>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool, bus })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                author_id TEXT NOT NULL,
                body TEXT NOT NULL,
                edited BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_scope_created ON messages(scope, created_at);

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_ref TEXT,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Save or update a user's profile and announce the change.
    pub async fn upsert_profile(&self, profile: &Profile) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, avatar_ref, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_ref = excluded.avatar_ref,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(profile.user_id.as_str())
        .bind(&profile.display_name)
        .bind(&profile.avatar_ref)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.bus
            .publish(Event::ProfileChanged(profile.user_id.clone()));
        Ok(())
    }

    async fn fetch_message(&self, id: &MessageId) -> SyncResult<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT id, scope, author_id, body, edited, created_at, updated_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }
}

fn message_from_row(row: &SqliteRow) -> SyncResult<Message> {
    let scope: String = row.try_get("scope")?;
    let scope = ConversationScope::from_str(&scope)
        .map_err(|e| SyncError::Transport(format!("corrupt row: {}", e)))?;
    let id: String = row.try_get("id")?;
    let author_id: String = row.try_get("author_id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Message {
        id: MessageId::new(id),
        scope,
        author_id: UserId::new(author_id),
        body: row.try_get("body")?,
        created_at,
        updated_at,
        edited: row.try_get("edited")?,
        local_id: None,
    })
}

#[async_trait]
impl MessageLog for Store {
    async fn list_messages(&self, scope: &ConversationScope) -> SyncResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scope, author_id, body, edited, created_at, updated_at
            FROM messages
            WHERE scope = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(scope.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<SyncResult<Vec<_>>>()?;

        // Text timestamps do not always sort like the instants they encode
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(messages)
    }

    async fn create_message(
        &self,
        scope: &ConversationScope,
        author: &UserId,
        body: &str,
    ) -> SyncResult<Message> {
        if !scope.includes(author) {
            return Err(SyncError::Unauthorized(format!(
                "{} is not a participant of {}",
                author, scope
            )));
        }

        let message = Message::new(
            MessageId::generate(),
            scope.clone(),
            author.clone(),
            body,
            Utc::now(),
        );

        sqlx::query(
            r#"
            INSERT INTO messages (id, scope, author_id, body, edited, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.as_str())
        .bind(scope.to_string())
        .bind(author.as_str())
        .bind(&message.body)
        .bind(message.edited)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(message_id = %message.id, scope = %scope, "Message stored");
        self.bus
            .publish(Event::Message(FeedEvent::Insert(message.clone())));
        Ok(message)
    }

    async fn update_message(&self, id: &MessageId, body: &str) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET body = ?, edited = 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(body)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(id.to_string()));
        }

        match self.fetch_message(id).await? {
            Some(message) => {
                self.bus.publish(Event::Message(FeedEvent::Update(message)));
            }
            None => warn!(message_id = %id, "Message vanished right after update"),
        }
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId, requester: &UserId) -> SyncResult<()> {
        let message = self
            .fetch_message(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        if &message.author_id != requester {
            return Err(SyncError::Unauthorized(format!(
                "{} is not the author of {}",
                requester, id
            )));
        }

        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND author_id = ?")
            .bind(id.as_str())
            .bind(requester.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(id.to_string()));
        }

        self.bus.publish(Event::Message(FeedEvent::Delete {
            id: id.clone(),
            scope: message.scope,
        }));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for Store {
    async fn subscribe(&self, scope: &ConversationScope) -> SyncResult<FeedStream> {
        let mut rx = self.bus.subscribe();
        let scope = scope.clone();

        Ok(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(Event::Message(event)) if event.scope() == &scope => yield Ok(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        yield Err(SyncError::ConnectionLost(format!(
                            "change feed lagged by {} events",
                            skipped
                        )));
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        .boxed())
    }
}

#[async_trait]
impl ProfileDirectory for Store {
    async fn get_profile(&self, user: &UserId) -> SyncResult<Profile> {
        let row = sqlx::query("SELECT id, display_name, avatar_ref FROM users WHERE id = ?")
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SyncError::NotFound(user.to_string()))?;

        Ok(Profile {
            user_id: user.clone(),
            display_name: row.try_get("display_name")?,
            avatar_ref: row.try_get("avatar_ref")?,
        })
    }
}
