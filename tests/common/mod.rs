#![allow(dead_code)]

use async_trait::async_trait;
use chat_mirror::{
    bus::EventBus,
    chat::ScopeTag,
    engine::Conversation,
    profile::ProfileResolver,
    remote::{ChangeFeed, FeedStream, MessageLog, ProfileDirectory},
    ConversationScope, ConversationView, FeedEvent, Message, MessageId, Profile, Remote, Store,
    SyncConfig, SyncError, SyncResult, UserId, ViewHandle, ViewSnapshot, WriteCoordinator,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch, Semaphore};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(id: &str, scope: &ConversationScope, author: &str, body: &str, secs: i64) -> Message {
    Message::new(id.into(), scope.clone(), author.into(), body, at(secs))
}

/// Directory that knows nobody.
pub struct NoDirectory;

#[async_trait]
impl ProfileDirectory for NoDirectory {
    async fn get_profile(&self, user: &UserId) -> SyncResult<Profile> {
        Err(SyncError::NotFound(user.to_string()))
    }
}

pub fn conversation(scope: ConversationScope) -> Conversation {
    Conversation::new(
        ScopeTag::new(scope, 1),
        Arc::new(ProfileResolver::new(Arc::new(NoDirectory))),
    )
}

pub async fn temp_store() -> (Arc<Store>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("chat.db"), Arc::new(EventBus::new()))
        .await
        .unwrap();
    store.init().await.unwrap();
    (Arc::new(store), dir)
}

pub fn config_for(user: &str) -> SyncConfig {
    let user = user.to_string();
    SyncConfig::from_lookup(move |key| match key {
        "CHAT_MIRROR_USER" => Some(user.clone()),
        _ => None,
    })
}

pub fn open_view(
    remote: Remote,
    user: &str,
    scope: ConversationScope,
) -> (ConversationView, WriteCoordinator) {
    let log = remote.log.clone();
    let view = ConversationView::open(remote, &config_for(user), scope);
    let writer = WriteCoordinator::new(log, view.handle(), UserId::new(user));
    (view, writer)
}

/// Wait for a snapshot matching `predicate`, failing the test after [`WAIT`].
pub async fn wait_until<F>(view: &ViewHandle, predicate: F) -> ViewSnapshot
where
    F: FnMut(&ViewSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, view.wait_for(predicate))
        .await
        .expect("timed out waiting for view")
        .expect("view closed")
}

/// Wait until the view has finished its fetch.
pub async fn settled(view: &ViewHandle) -> ViewSnapshot {
    wait_until(view, |s| !s.syncing).await
}

pub fn bodies(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot
        .messages
        .iter()
        .map(|m| m.message.body.clone())
        .collect()
}

pub fn ids(snapshot: &ViewSnapshot) -> Vec<MessageId> {
    snapshot
        .messages
        .iter()
        .map(|m| m.message.id.clone())
        .collect()
}

/// Log wrapper that can hold fetches back and reject writes.
///
/// A gated fetch reads its records immediately but only returns them once
/// the gate opens, so the result is older than anything written meanwhile.
pub struct ScriptedLog {
    inner: Arc<Store>,
    gate: Semaphore,
    fetches: watch::Sender<usize>,
    pub fail_writes: AtomicBool,
}

impl ScriptedLog {
    pub fn new(inner: Arc<Store>) -> Self {
        Self::with_gate(inner, Semaphore::MAX_PERMITS)
    }

    pub fn gated(inner: Arc<Store>) -> Self {
        Self::with_gate(inner, 0)
    }

    fn with_gate(inner: Arc<Store>, permits: usize) -> Self {
        let (fetches, _) = watch::channel(0);
        Self {
            inner,
            gate: Semaphore::new(permits),
            fetches,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1);
    }

    /// Resolves once `count` fetches have read their records.
    pub async fn fetches_started(&self, count: usize) {
        let mut rx = self.fetches.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for fetch")
            .expect("fetch counter dropped");
    }

    fn check_write(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::Transport("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageLog for ScriptedLog {
    async fn list_messages(&self, scope: &ConversationScope) -> SyncResult<Vec<Message>> {
        let records = self.inner.list_messages(scope).await;
        self.fetches.send_modify(|n| *n += 1);
        // Each opening of the gate releases exactly one fetch
        self.gate
            .acquire()
            .await
            .map_err(|_| SyncError::ViewClosed)?
            .forget();
        records
    }

    async fn create_message(
        &self,
        scope: &ConversationScope,
        author: &UserId,
        body: &str,
    ) -> SyncResult<Message> {
        self.check_write()?;
        self.inner.create_message(scope, author, body).await
    }

    async fn update_message(&self, id: &MessageId, body: &str) -> SyncResult<()> {
        self.check_write()?;
        self.inner.update_message(id, body).await
    }

    async fn delete_message(&self, id: &MessageId, requester: &UserId) -> SyncResult<()> {
        self.check_write()?;
        self.inner.delete_message(id, requester).await
    }
}

/// Change feed driven by hand. Dropping the senders ends every stream.
#[derive(Default)]
pub struct ManualFeed {
    senders: Mutex<Vec<(ConversationScope, mpsc::UnboundedSender<SyncResult<FeedEvent>>)>>,
    subscriptions: AtomicUsize,
    pub refuse: AtomicBool,
}

impl ManualFeed {
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every open stream of its scope. Returns how many
    /// streams accepted it.
    pub fn push(&self, event: FeedEvent) -> usize {
        let senders = self.senders.lock().unwrap();
        senders
            .iter()
            .filter(|(scope, _)| scope == event.scope())
            .filter(|(_, tx)| tx.send(Ok(event.clone())).is_ok())
            .count()
    }

    pub fn disconnect_all(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChangeFeed for ManualFeed {
    async fn subscribe(&self, scope: &ConversationScope) -> SyncResult<FeedStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Unauthorized("feed access denied".into()));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push((scope.clone(), tx));
        Ok(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }
        .boxed())
    }
}
