//! Configuration for the chat mirror.

use crate::chat::{ConversationScope, GLOBAL_ROOM};
use crate::engine::DEFAULT_ECHO_WINDOW_SECS;
use crate::entity::UserId;
use std::path::PathBuf;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path of the SQLite message log
    pub database_path: PathBuf,

    /// The local user
    pub user_id: UserId,

    /// Display name registered for the local user
    pub display_name: String,

    /// Room entered on startup
    pub room: String,

    /// Events a slow feed subscriber may fall behind before it must resync
    pub feed_capacity: usize,

    /// Clock-skew allowance when matching feed echoes to pending sends
    pub echo_window_secs: i64,

    /// Print snapshots as JSON lines instead of text
    pub json_output: bool,
}

impl SyncConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, falling back to
    /// defaults for anything missing or unparseable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
        let database_path = lookup("CHAT_MIRROR_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(home_dir)
                    .join(".chat-mirror")
                    .join("chat.db")
            });

        let user_id = lookup("CHAT_MIRROR_USER").unwrap_or_else(|| "local".to_string());
        let display_name = lookup("CHAT_MIRROR_NAME").unwrap_or_else(|| user_id.clone());
        let room = lookup("CHAT_MIRROR_ROOM")
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| GLOBAL_ROOM.to_string());

        let feed_capacity: usize = lookup("CHAT_MIRROR_FEED_CAPACITY")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(crate::bus::DEFAULT_CAPACITY);

        let echo_window_secs: i64 = lookup("CHAT_MIRROR_ECHO_WINDOW_SECS")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n >= 0)
            .unwrap_or(DEFAULT_ECHO_WINDOW_SECS);

        let json_output = lookup("CHAT_MIRROR_JSON")
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            database_path,
            user_id: UserId::new(user_id),
            display_name,
            room,
            feed_capacity,
            echo_window_secs,
            json_output,
        }
    }

    pub fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.echo_window_secs)
    }

    pub fn initial_scope(&self) -> ConversationScope {
        ConversationScope::room(self.room.clone())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
