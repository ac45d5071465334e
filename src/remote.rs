//! Contracts of the remote collaborators the sync core talks to.
//!
//! The core never assumes a wire format. Anything that can list, write and
//! stream changes of the message log, and look up profiles, plugs in here.
//! [`crate::store::Store`] is the SQLite-backed implementation.

use crate::chat::{ConversationScope, FeedEvent, Message, MessageId};
use crate::entity::{Profile, UserId};
use crate::error::SyncResult;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Live change notifications for one scope.
pub type FeedStream = BoxStream<'static, SyncResult<FeedEvent>>;

/// Request/response access to the message log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// All messages of a scope, sorted by `(created_at, id)`.
    async fn list_messages(&self, scope: &ConversationScope) -> SyncResult<Vec<Message>>;

    /// Append a message; the returned record carries the server id and timestamp.
    async fn create_message(
        &self,
        scope: &ConversationScope,
        author: &UserId,
        body: &str,
    ) -> SyncResult<Message>;

    async fn update_message(&self, id: &MessageId, body: &str) -> SyncResult<()>;

    async fn delete_message(&self, id: &MessageId, requester: &UserId) -> SyncResult<()>;
}

/// Streaming change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a stream of changes for `scope`. Delivery is at-least-once and
    /// unordered; a dropped connection surfaces as `ConnectionLost`.
    async fn subscribe(&self, scope: &ConversationScope) -> SyncResult<FeedStream>;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn get_profile(&self, user: &UserId) -> SyncResult<Profile>;
}
