//! The conversation view: one actor task per open view that owns the
//! [`Conversation`] and serializes every mutation of it.
//!
//! Fetches, feed subscriptions and profile lookups run on their own tasks and
//! report back through the actor's queue, tagged with the [`ScopeTag`] they
//! were started under. Results for a superseded tag are discarded. Snapshots
//! go out on a `watch` channel after every handled command.

use crate::chat::{
    ConversationScope, Draft, EnrichedMessage, LocalId, Message, MessageId, ProvisionalMessage,
    ScopeTag,
};
use crate::config::SyncConfig;
use crate::engine::Conversation;
use crate::entity::UserId;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::feed::{FeedSignal, FeedSubscriber, SubscriptionHandle};
use crate::profile::ProfileResolver;
use crate::remote::{ChangeFeed, MessageLog, ProfileDirectory};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the UI layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub scope: ConversationScope,
    pub epoch: u64,
    pub messages: Vec<EnrichedMessage>,
    /// An initial fetch or resync is in flight.
    pub syncing: bool,
    /// No live change feed; only fetches keep the view current.
    pub degraded: bool,
    /// Last fetch failure, cleared by the next successful fetch.
    pub last_error: Option<SyncError>,
}

impl ViewSnapshot {
    fn empty(tag: &ScopeTag) -> Self {
        Self {
            scope: tag.scope.clone(),
            epoch: tag.epoch,
            messages: Vec::new(),
            syncing: true,
            degraded: false,
            last_error: None,
        }
    }

    /// Confirmed message by server id.
    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .filter(|m| !m.pending)
            .map(|m| &m.message)
            .find(|m| &m.id == id)
    }
}

enum Command {
    Feed(FeedSignal),
    Fetched(ScopeTag, u64, SyncResult<Vec<Message>>),
    ProfileResolved(ScopeTag, UserId),
    OptimisticInsert {
        local_id: LocalId,
        draft: Draft,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Confirm {
        local_id: LocalId,
        record: Message,
        reply: oneshot::Sender<SyncResult<ProvisionalMessage>>,
    },
    Fail {
        local_id: LocalId,
        kind: ErrorKind,
        reply: oneshot::Sender<SyncResult<ProvisionalMessage>>,
    },
    Hide(MessageId, oneshot::Sender<bool>),
    Unhide(MessageId, oneshot::Sender<bool>),
    Resync,
    RefreshProfile(UserId),
    SwitchScope(ConversationScope, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// The remote collaborators a view needs.
#[derive(Clone)]
pub struct Remote {
    pub log: Arc<dyn MessageLog>,
    pub feed: Arc<dyn ChangeFeed>,
    pub profiles: Arc<dyn ProfileDirectory>,
}

impl Remote {
    /// All three contracts served by one backend.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MessageLog + ChangeFeed + ProfileDirectory + 'static,
    {
        Self {
            log: backend.clone(),
            feed: backend.clone(),
            profiles: backend,
        }
    }
}

/// Cloneable access to a running view.
#[derive(Clone)]
pub struct ViewHandle {
    tx: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ViewSnapshot>,
    profiles: Arc<ProfileResolver>,
}

impl ViewHandle {
    pub fn snapshot(&self) -> ViewSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn scope(&self) -> ConversationScope {
        self.snapshots.borrow().scope.clone()
    }

    /// Receiver that wakes on every new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.snapshots.clone()
    }

    pub fn profiles(&self) -> &Arc<ProfileResolver> {
        &self.profiles
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> SyncResult<ViewSnapshot>
    where
        F: FnMut(&ViewSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SyncError::ViewClosed)?;
        Ok(ViewSnapshot::clone(&snapshot))
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.tx.send(command).map_err(|_| SyncError::ViewClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| SyncError::ViewClosed)
    }

    pub async fn optimistic_insert(&self, local_id: LocalId, draft: Draft) -> SyncResult<()> {
        self.request(|reply| Command::OptimisticInsert {
            local_id,
            draft,
            reply,
        })
        .await?
    }

    pub async fn confirm_optimistic(
        &self,
        local_id: LocalId,
        record: Message,
    ) -> SyncResult<ProvisionalMessage> {
        self.request(|reply| Command::Confirm {
            local_id,
            record,
            reply,
        })
        .await?
    }

    pub async fn fail_optimistic(
        &self,
        local_id: LocalId,
        kind: ErrorKind,
    ) -> SyncResult<ProvisionalMessage> {
        self.request(|reply| Command::Fail {
            local_id,
            kind,
            reply,
        })
        .await?
    }

    pub async fn hide(&self, id: MessageId) -> SyncResult<bool> {
        self.request(|reply| Command::Hide(id, reply)).await
    }

    pub async fn unhide(&self, id: MessageId) -> SyncResult<bool> {
        self.request(|reply| Command::Unhide(id, reply)).await
    }

    /// Reconnect the change feed and refetch.
    pub fn resync(&self) -> SyncResult<()> {
        self.send(Command::Resync)
    }

    /// Drop a cached profile and look it up again.
    pub fn refresh_profile(&self, user: UserId) -> SyncResult<()> {
        self.send(Command::RefreshProfile(user))
    }

    /// Leave the current scope and enter `scope`. Returns once the old
    /// subscription is closed and the new one is open.
    pub async fn switch_scope(&self, scope: ConversationScope) -> SyncResult<()> {
        self.request(|reply| Command::SwitchScope(scope, reply))
            .await
    }
}

/// A running conversation view. Owns the actor task.
pub struct ConversationView {
    handle: ViewHandle,
    task: JoinHandle<()>,
}

impl ConversationView {
    /// Enter `scope`: subscribe to its feed and start the initial fetch.
    pub fn open(remote: Remote, config: &SyncConfig, scope: ConversationScope) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let profiles = Arc::new(ProfileResolver::new(remote.profiles.clone()));
        let tag = ScopeTag::new(scope, 1);
        let (snapshot_tx, snapshot_rx) = watch::channel(ViewSnapshot::empty(&tag));

        let actor = ViewActor {
            conversation: Conversation::new(tag, profiles.clone())
                .with_echo_window(config.echo_window()),
            echo_window: config.echo_window(),
            log: remote.log,
            subscriber: FeedSubscriber::new(remote.feed),
            profiles: profiles.clone(),
            subscription: None,
            requested_profiles: HashSet::new(),
            syncing: false,
            last_error: None,
            tx: tx.clone(),
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(actor.run(rx));

        Self {
            handle: ViewHandle {
                tx,
                snapshots: snapshot_rx,
                profiles,
            },
            task,
        }
    }

    pub fn handle(&self) -> ViewHandle {
        self.handle.clone()
    }

    /// Tear the view down: close the subscription and stop the actor.
    pub async fn close(self) {
        if let Ok(()) = self.handle.request(Command::Shutdown).await {
            let _ = self.task.await;
        } else {
            self.task.abort();
        }
    }
}

impl std::ops::Deref for ConversationView {
    type Target = ViewHandle;

    fn deref(&self) -> &ViewHandle {
        &self.handle
    }
}

struct ViewActor {
    conversation: Conversation,
    echo_window: chrono::Duration,
    log: Arc<dyn MessageLog>,
    subscriber: FeedSubscriber,
    profiles: Arc<ProfileResolver>,
    subscription: Option<SubscriptionHandle>,
    requested_profiles: HashSet<UserId>,
    syncing: bool,
    last_error: Option<SyncError>,
    tx: mpsc::UnboundedSender<Command>,
    snapshots: watch::Sender<ViewSnapshot>,
}

impl ViewActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(tag = %self.conversation.tag(), "Conversation view opened");
        self.connect().await;
        self.publish();

        while let Some(command) = rx.recv().await {
            if let Command::Shutdown(reply) = command {
                self.disconnect().await;
                info!(tag = %self.conversation.tag(), "Conversation view closed");
                let _ = reply.send(());
                return;
            }
            self.handle(command).await;
            self.request_profiles();
            self.publish();
        }

        // Every handle is gone
        self.disconnect().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Feed(FeedSignal::Event(tag, event)) => {
                let applied = self.conversation.apply_tagged(&tag, event);
                debug!(tag = %tag, ?applied, "Applied feed event");
            }
            Command::Feed(FeedSignal::ConnectionLost(tag, err)) => {
                if &tag == self.conversation.tag() {
                    warn!(tag = %tag, error = %err, "Change feed lost, resyncing");
                    self.connect().await;
                }
            }
            Command::Fetched(tag, generation, result) => self.on_fetched(tag, generation, result),
            // The resolved profile is in the shared cache now; the publish
            // after this handler renders it.
            Command::ProfileResolved(tag, user) => {
                if &tag != self.conversation.tag() {
                    debug!(tag = %tag, user_id = %user, "Discarding late profile result");
                }
            }
            Command::OptimisticInsert {
                local_id,
                draft,
                reply,
            } => {
                let _ = reply.send(self.conversation.apply_optimistic_insert(local_id, draft));
            }
            Command::Confirm {
                local_id,
                record,
                reply,
            } => {
                let _ = reply.send(self.conversation.confirm_optimistic(local_id, record));
            }
            Command::Fail {
                local_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.conversation.fail_optimistic(local_id, kind));
            }
            Command::Hide(id, reply) => {
                let _ = reply.send(self.conversation.hide(&id));
            }
            Command::Unhide(id, reply) => {
                let _ = reply.send(self.conversation.unhide(&id));
            }
            Command::Resync => {
                info!(tag = %self.conversation.tag(), "Manual resync");
                self.connect().await;
            }
            Command::RefreshProfile(user) => {
                self.profiles.invalidate(&user);
                self.requested_profiles.remove(&user);
            }
            Command::SwitchScope(scope, reply) => {
                self.enter(scope).await;
                // Callers read the scope from the snapshot right after this returns
                self.publish();
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Replace the conversation with a fresh one for `scope` under a new epoch.
    async fn enter(&mut self, scope: ConversationScope) {
        self.disconnect().await;

        let epoch = self.conversation.tag().epoch + 1;
        let tag = ScopeTag::new(scope, epoch);
        info!(from = %self.conversation.tag(), to = %tag, "Switching conversation scope");

        self.conversation = Conversation::new(tag, self.profiles.clone())
            .with_echo_window(self.echo_window);
        self.last_error = None;
        self.connect().await;
    }

    async fn disconnect(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.close().await;
        }
    }

    /// (Re)open the feed for the current tag, then refetch.
    async fn connect(&mut self) {
        self.disconnect().await;

        let tag = self.conversation.tag().clone();
        let tx = self.tx.clone();
        let subscription = self
            .subscriber
            .open(tag.clone(), move |signal| {
                let _ = tx.send(Command::Feed(signal));
            })
            .await;
        self.subscription = Some(subscription);

        let generation = self.conversation.begin_resync();
        self.syncing = true;

        let log = self.log.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = log.list_messages(&tag.scope).await;
            let _ = tx.send(Command::Fetched(tag, generation, result));
        });
    }

    fn on_fetched(&mut self, tag: ScopeTag, generation: u64, result: SyncResult<Vec<Message>>) {
        if &tag != self.conversation.tag() {
            debug!(tag = %tag, "Discarding fetch for superseded scope");
            return;
        }
        // A newer fetch was issued after this one; its result decides
        if !self.conversation.is_current_fetch(generation) {
            debug!(tag = %tag, generation, "Discarding superseded fetch");
            return;
        }
        self.syncing = false;
        match result {
            Ok(records) => {
                debug!(tag = %tag, count = records.len(), "Initial fetch completed");
                self.conversation.apply_initial_fetch(records);
                self.last_error = None;
            }
            Err(e) => {
                warn!(tag = %tag, error = %e, "Initial fetch failed");
                self.conversation.abort_resync();
                self.last_error = Some(e);
            }
        }
    }

    /// Start one lookup per author that is on screen without a profile.
    fn request_profiles(&mut self) {
        for user in self.conversation.missing_profiles() {
            if !self.requested_profiles.insert(user.clone()) {
                continue;
            }
            let profiles = self.profiles.clone();
            let tx = self.tx.clone();
            let tag = self.conversation.tag().clone();
            tokio::spawn(async move {
                // Failures fall back to the placeholder already shown
                let _ = profiles.resolve(&user).await;
                let _ = tx.send(Command::ProfileResolved(tag, user));
            });
        }
    }

    fn publish(&self) {
        let tag = self.conversation.tag();
        let degraded = !self
            .subscription
            .as_ref()
            .is_some_and(|s| s.is_live());
        self.snapshots.send_replace(ViewSnapshot {
            scope: tag.scope.clone(),
            epoch: tag.epoch,
            messages: self.conversation.snapshot(),
            syncing: self.syncing,
            degraded,
            last_error: self.last_error.clone(),
        });
    }
}
