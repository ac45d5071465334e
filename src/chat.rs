use crate::entity::{Profile, UserId};
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Tag of the room every user can see.
pub const GLOBAL_ROOM: &str = "global";

/// Partition of the message log: a named room or a two-person thread.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConversationScope {
    Room(String),
    /// Participants are stored in ascending order; build with [`ConversationScope::direct`].
    Direct(UserId, UserId),
}

impl ConversationScope {
    pub fn room(tag: impl Into<String>) -> Self {
        ConversationScope::Room(tag.into())
    }

    pub fn global() -> Self {
        ConversationScope::Room(GLOBAL_ROOM.to_string())
    }

    /// Thread between two users; argument order does not matter.
    pub fn direct(a: UserId, b: UserId) -> Self {
        if a <= b {
            ConversationScope::Direct(a, b)
        } else {
            ConversationScope::Direct(b, a)
        }
    }

    pub fn includes(&self, user: &UserId) -> bool {
        match self {
            ConversationScope::Room(_) => true,
            ConversationScope::Direct(a, b) => a == user || b == user,
        }
    }
}

impl fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationScope::Room(tag) => write!(f, "room:{}", tag),
            // User ids may contain ':', so the first one is length-prefixed
            ConversationScope::Direct(a, b) => {
                write!(f, "dm:{}:{}:{}", a.as_str().len(), a, b)
            }
        }
    }
}

/// Split `<len>:<a>:<b>` where `len` is the byte length of `a`.
fn split_participants(s: &str) -> Option<(&str, &str)> {
    let (len, rest) = s.split_once(':')?;
    let len: usize = len.parse().ok()?;
    let a = rest.get(..len)?;
    let b = rest.get(len..)?.strip_prefix(':')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a, b))
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid conversation scope: {0}")]
pub struct ParseScopeError(String);

impl FromStr for ConversationScope {
    type Err = ParseScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(tag) = s.strip_prefix("room:") {
            if !tag.is_empty() {
                return Ok(ConversationScope::room(tag));
            }
        } else if let Some(rest) = s.strip_prefix("dm:") {
            if let Some((a, b)) = split_participants(rest) {
                return Ok(ConversationScope::direct(UserId::new(a), UserId::new(b)));
            }
        }
        Err(ParseScopeError(s.to_string()))
    }
}

/// Server-assigned message id. Ordered lexicographically for tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh time-ordered id, as assigned by the store.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Display id for a provisional message that has no server id yet.
    pub fn provisional(local_id: LocalId) -> Self {
        Self(format!("local:{}", local_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Client-assigned id of an unconfirmed local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub scope: ConversationScope,
    pub author_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Time of the last edit; equals `created_at` for unedited messages.
    pub updated_at: DateTime<Utc>,
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalId>,
}

impl Message {
    pub fn new(
        id: MessageId,
        scope: ConversationScope,
        author_id: UserId,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            scope,
            author_id,
            body: body.into(),
            created_at,
            updated_at: created_at,
            edited: false,
            local_id: None,
        }
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }
}

/// Sort key of the materialized view: `created_at`, then `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

/// What the local user typed, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub author_id: UserId,
    pub body: String,
}

impl Draft {
    pub fn new(author_id: UserId, body: impl Into<String>) -> Self {
        Self {
            author_id,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionalState {
    Pending,
    Confirmed,
    Failed(ErrorKind),
}

/// Locally shown copy of an in-flight send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalMessage {
    pub local_id: LocalId,
    pub scope: ConversationScope,
    pub draft: Draft,
    pub sent_at: DateTime<Utc>,
    pub state: ProvisionalState,
    /// Server id of a feed insert recognised as this send's echo.
    pub echo_of: Option<MessageId>,
}

impl ProvisionalMessage {
    pub fn is_pending(&self) -> bool {
        self.state == ProvisionalState::Pending
    }

    /// The provisional rendered as a message.
    pub fn to_message(&self) -> Message {
        Message {
            id: MessageId::provisional(self.local_id),
            scope: self.scope.clone(),
            author_id: self.draft.author_id.clone(),
            body: self.draft.body.clone(),
            created_at: self.sent_at,
            updated_at: self.sent_at,
            edited: false,
            local_id: Some(self.local_id),
        }
    }
}

/// A message joined with its sender's profile, ready to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender: Profile,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedOp {
    Insert,
    Update,
    Delete,
}

/// One change notification from the remote log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "record")]
pub enum FeedEvent {
    Insert(Message),
    Update(Message),
    /// Delete notifications only carry the identity of the removed row.
    Delete {
        id: MessageId,
        scope: ConversationScope,
    },
}

impl FeedEvent {
    pub fn op(&self) -> FeedOp {
        match self {
            FeedEvent::Insert(_) => FeedOp::Insert,
            FeedEvent::Update(_) => FeedOp::Update,
            FeedEvent::Delete { .. } => FeedOp::Delete,
        }
    }

    pub fn id(&self) -> &MessageId {
        match self {
            FeedEvent::Insert(m) | FeedEvent::Update(m) => &m.id,
            FeedEvent::Delete { id, .. } => id,
        }
    }

    pub fn scope(&self) -> &ConversationScope {
        match self {
            FeedEvent::Insert(m) | FeedEvent::Update(m) => &m.scope,
            FeedEvent::Delete { scope, .. } => scope,
        }
    }
}

/// Identifies one entry into a scope. Results started under an older tag are
/// stale once the view has moved on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeTag {
    pub scope: ConversationScope,
    pub epoch: u64,
}

impl ScopeTag {
    pub fn new(scope: ConversationScope, epoch: u64) -> Self {
        Self { scope, epoch }
    }
}

impl fmt::Display for ScopeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scope, self.epoch)
    }
}
