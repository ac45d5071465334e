//! Per-conversation reconciliation of fetched, streamed and optimistic messages.
//!
//! A [`Conversation`] owns the ordered message collection of one scope. All
//! three sources of truth go through the same merge rules:
//!
//! - the initial (or re-run) bulk fetch replaces the confirmed collection,
//! - feed events insert, update or delete single records,
//! - optimistic sends add one provisional entry that is later confirmed or
//!   rolled back.
//!
//! Records are kept sorted by `(created_at, id)` and unique by id. The type is
//! not thread-safe on purpose: callers serialize access per scope (see
//! [`crate::view`]).

use crate::chat::{
    ConversationScope, Draft, EnrichedMessage, FeedEvent, LocalId, Message, MessageId, OrderKey,
    ProvisionalMessage, ProvisionalState, ScopeTag,
};
use crate::entity::{Profile, UserId};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::profile::ProfileResolver;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// How many seconds before the send time a feed insert may be stamped and
/// still count as the echo of a pending provisional message.
pub const DEFAULT_ECHO_WINDOW_SECS: i64 = 30;

/// Outcome of applying one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The collection changed.
    Changed,
    /// Valid change with no visible effect (duplicate, stale, absent id).
    Unchanged,
    /// Update for an id not seen yet; held until its insert arrives.
    Deferred,
    /// Event belongs to another scope or subscription and was discarded.
    Dropped,
}

impl Applied {
    pub fn changed(self) -> bool {
        self == Applied::Changed
    }
}

pub struct Conversation {
    tag: ScopeTag,
    profiles: Arc<ProfileResolver>,
    echo_window: chrono::Duration,
    entries: BTreeMap<OrderKey, Message>,
    index: HashMap<MessageId, OrderKey>,
    deferred_updates: HashMap<MessageId, Message>,
    hidden: HashSet<MessageId>,
    /// Ids deleted in this scope. Server ids are never reused, so any later
    /// copy of one is a stale or duplicate delivery.
    deleted: HashSet<MessageId>,
    provisional: Option<ProvisionalMessage>,
    /// Feed events applied since the oldest unfinished `begin_resync`,
    /// replayed over the fetch that completes it.
    resync_log: Option<Vec<FeedEvent>>,
    fetch_generation: u64,
}

impl Conversation {
    pub fn new(tag: ScopeTag, profiles: Arc<ProfileResolver>) -> Self {
        Self {
            tag,
            profiles,
            echo_window: chrono::Duration::seconds(DEFAULT_ECHO_WINDOW_SECS),
            entries: BTreeMap::new(),
            index: HashMap::new(),
            deferred_updates: HashMap::new(),
            hidden: HashSet::new(),
            deleted: HashSet::new(),
            provisional: None,
            resync_log: None,
            fetch_generation: 0,
        }
    }

    pub fn with_echo_window(mut self, window: chrono::Duration) -> Self {
        self.echo_window = window;
        self
    }

    pub fn tag(&self) -> &ScopeTag {
        &self.tag
    }

    pub fn scope(&self) -> &ConversationScope {
        &self.tag.scope
    }

    // --- Bulk fetch ---

    /// Start recording feed events so the next `apply_initial_fetch` can
    /// replay the ones its (older) snapshot may be missing.
    ///
    /// Returns the generation of the fetch about to be issued. A resync begun
    /// while another is unfinished keeps the existing log, and only the
    /// latest generation's result may be applied.
    pub fn begin_resync(&mut self) -> u64 {
        if self.resync_log.is_none() {
            self.resync_log = Some(Vec::new());
        }
        self.fetch_generation += 1;
        self.fetch_generation
    }

    /// Whether a fetch issued under `generation` is the one to apply.
    pub fn is_current_fetch(&self, generation: u64) -> bool {
        generation == self.fetch_generation
    }

    /// Forget a resync whose fetch failed.
    pub fn abort_resync(&mut self) {
        self.resync_log = None;
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync_log.is_some()
    }

    /// Replace the confirmed collection with `records`.
    ///
    /// Idempotent. Buffered updates survive only for ids present in the fetch.
    pub fn apply_initial_fetch(&mut self, records: Vec<Message>) {
        let known: HashSet<MessageId> = self.index.keys().cloned().collect();
        let mut deferred = std::mem::take(&mut self.deferred_updates);
        self.entries.clear();
        self.index.clear();

        for mut record in records {
            if record.scope != self.tag.scope {
                debug!(scope = %self.tag.scope, message_id = %record.id, "Skipping fetched record from another scope");
                continue;
            }
            if let Some(update) = deferred.remove(&record.id) {
                merge_update(&mut record, &update);
            }
            let is_new = !known.contains(&record.id);
            self.store(record, is_new);
        }

        self.hidden.retain(|id| self.index.contains_key(id));

        if let Some(log) = self.resync_log.take() {
            debug!(scope = %self.tag.scope, replayed = log.len(), "Replaying feed events over fetch");
            for event in log {
                self.apply_event(event);
            }
        }
    }

    // --- Feed events ---

    /// Apply an event only if it was delivered for this conversation's tag.
    pub fn apply_tagged(&mut self, tag: &ScopeTag, event: FeedEvent) -> Applied {
        if tag != &self.tag {
            debug!(
                active = %self.tag,
                stale = %tag,
                message_id = %event.id(),
                "Dropping feed event for superseded scope"
            );
            return Applied::Dropped;
        }
        self.apply_feed_event(event)
    }

    pub fn apply_feed_event(&mut self, event: FeedEvent) -> Applied {
        if event.scope() != &self.tag.scope {
            debug!(
                scope = %self.tag.scope,
                event_scope = %event.scope(),
                "Dropping feed event from another scope"
            );
            return Applied::Dropped;
        }
        if let Some(log) = self.resync_log.as_mut() {
            log.push(event.clone());
        }
        self.apply_event(event)
    }

    fn apply_event(&mut self, event: FeedEvent) -> Applied {
        match event {
            FeedEvent::Insert(record) => self.insert(record),
            FeedEvent::Update(record) => self.update(record),
            FeedEvent::Delete { id, .. } => self.delete(&id),
        }
    }

    fn insert(&mut self, mut record: Message) -> Applied {
        if let Some(update) = self.deferred_updates.remove(&record.id) {
            merge_update(&mut record, &update);
        }
        let is_new = !self.index.contains_key(&record.id);
        self.store(record, is_new)
    }

    /// Upsert keyed by id, re-positioned by the ordering key.
    fn store(&mut self, mut record: Message, is_new: bool) -> Applied {
        if self.deleted.contains(&record.id) {
            debug!(scope = %self.tag.scope, message_id = %record.id, "Ignoring copy of a deleted message");
            return Applied::Unchanged;
        }
        record.local_id = None;

        let previous = match self.index.remove(&record.id) {
            Some(old_key) => self.entries.remove(&old_key),
            None => None,
        };

        if let Some(existing) = &previous {
            // A late duplicate insert must not undo an edit already applied
            if existing.updated_at > record.updated_at {
                record.body = existing.body.clone();
                record.edited = existing.edited;
                record.updated_at = existing.updated_at;
            }
        }

        if is_new {
            self.note_echo(&record);
        }

        let changed = previous.as_ref() != Some(&record);
        let key = record.order_key();
        self.index.insert(record.id.clone(), key.clone());
        self.entries.insert(key, record);

        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    fn update(&mut self, record: Message) -> Applied {
        if let Some(key) = self.index.get(&record.id) {
            return match self.entries.get_mut(key) {
                Some(existing) => {
                    if merge_update(existing, &record) {
                        Applied::Changed
                    } else {
                        Applied::Unchanged
                    }
                }
                None => Applied::Unchanged,
            };
        }

        let newer = self
            .deferred_updates
            .get(&record.id)
            .map_or(true, |held| record.updated_at >= held.updated_at);
        if newer {
            debug!(scope = %self.tag.scope, message_id = %record.id, "Buffering update that arrived before its insert");
            self.deferred_updates.insert(record.id.clone(), record);
        }
        Applied::Deferred
    }

    fn delete(&mut self, id: &MessageId) -> Applied {
        self.deleted.insert(id.clone());
        self.deferred_updates.remove(id);
        self.hidden.remove(id);
        match self.index.remove(id) {
            Some(key) => {
                self.entries.remove(&key);
                Applied::Changed
            }
            None => Applied::Unchanged,
        }
    }

    // --- Optimistic writes ---

    /// Show `draft` at the tail before the server has accepted it.
    ///
    /// Only one send may be pending; a second one is rejected with
    /// [`SyncError::SendInFlight`] until the first is confirmed or failed.
    pub fn apply_optimistic_insert(&mut self, local_id: LocalId, draft: Draft) -> SyncResult<()> {
        self.apply_optimistic_insert_at(local_id, draft, Utc::now())
    }

    pub fn apply_optimistic_insert_at(
        &mut self,
        local_id: LocalId,
        draft: Draft,
        sent_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        if self.provisional.as_ref().is_some_and(|p| p.is_pending()) {
            return Err(SyncError::SendInFlight);
        }
        self.provisional = Some(ProvisionalMessage {
            local_id,
            scope: self.tag.scope.clone(),
            draft,
            sent_at,
            state: ProvisionalState::Pending,
            echo_of: None,
        });
        Ok(())
    }

    /// Replace the provisional entry with the server's record.
    ///
    /// The record is upserted like a feed insert, so whichever of the
    /// confirmation and the feed echo comes second is a no-op.
    pub fn confirm_optimistic(
        &mut self,
        local_id: LocalId,
        server_record: Message,
    ) -> SyncResult<ProvisionalMessage> {
        let mut provisional = self.take_provisional(local_id)?;
        provisional.state = ProvisionalState::Confirmed;

        if server_record.scope == self.tag.scope {
            if let Some(log) = self.resync_log.as_mut() {
                log.push(FeedEvent::Insert(server_record.clone()));
            }
            self.insert(server_record);
        }
        Ok(provisional)
    }

    /// Roll the provisional entry back. The returned copy carries the error
    /// kind so the caller can offer a manual retry.
    pub fn fail_optimistic(
        &mut self,
        local_id: LocalId,
        kind: ErrorKind,
    ) -> SyncResult<ProvisionalMessage> {
        let mut provisional = self.take_provisional(local_id)?;
        provisional.state = ProvisionalState::Failed(kind);
        Ok(provisional)
    }

    fn take_provisional(&mut self, local_id: LocalId) -> SyncResult<ProvisionalMessage> {
        match self.provisional.take() {
            Some(p) if p.local_id == local_id => Ok(p),
            other => {
                self.provisional = other;
                Err(SyncError::UnknownLocalId(local_id.to_string()))
            }
        }
    }

    fn note_echo(&mut self, record: &Message) {
        let window = self.echo_window;
        if let Some(p) = self.provisional.as_mut() {
            if p.is_pending()
                && p.echo_of.is_none()
                && p.draft.author_id == record.author_id
                && p.draft.body == record.body
                && record.created_at >= p.sent_at - window
            {
                debug!(local_id = %p.local_id, message_id = %record.id, "Feed echo supersedes provisional message");
                p.echo_of = Some(record.id.clone());
            }
        }
    }

    pub fn provisional(&self) -> Option<&ProvisionalMessage> {
        self.provisional.as_ref()
    }

    // --- Local hide for deletes in flight ---

    /// Hide a record until its feed delete arrives. Returns false if unknown.
    pub fn hide(&mut self, id: &MessageId) -> bool {
        if self.index.contains_key(id) {
            self.hidden.insert(id.clone())
        } else {
            false
        }
    }

    pub fn unhide(&mut self, id: &MessageId) -> bool {
        self.hidden.remove(id)
    }

    // --- Reads ---

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    /// Confirmed, visible messages in display order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries
            .values()
            .filter(|m| !self.hidden.contains(&m.id))
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.hidden.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn visible_provisional(&self) -> Option<&ProvisionalMessage> {
        self.provisional
            .as_ref()
            .filter(|p| p.is_pending() && p.echo_of.is_none())
    }

    /// Authors on screen whose profile is not cached yet.
    pub fn missing_profiles(&self) -> Vec<UserId> {
        let mut missing = BTreeSet::new();
        let authors = self
            .messages()
            .map(|m| &m.author_id)
            .chain(self.visible_provisional().map(|p| &p.draft.author_id));
        for author in authors {
            if !self.profiles.is_cached(author) {
                missing.insert(author.clone());
            }
        }
        missing.into_iter().collect()
    }

    /// The ordered, enriched list to display. The pending provisional
    /// message, if any, is last.
    pub fn snapshot(&self) -> Vec<EnrichedMessage> {
        let mut view: Vec<EnrichedMessage> = self
            .messages()
            .map(|m| self.enrich(m.clone(), false))
            .collect();
        if let Some(p) = self.visible_provisional() {
            view.push(self.enrich(p.to_message(), true));
        }
        view
    }

    fn enrich(&self, message: Message, pending: bool) -> EnrichedMessage {
        let sender = self
            .profiles
            .cached(&message.author_id)
            .unwrap_or_else(|| Profile::placeholder(message.author_id.clone()));
        EnrichedMessage {
            message,
            sender,
            pending,
        }
    }
}

/// Copy the mutable fields of `update` onto `target` unless it is stale.
fn merge_update(target: &mut Message, update: &Message) -> bool {
    if update.updated_at < target.updated_at {
        return false;
    }
    let changed = target.body != update.body
        || target.edited != update.edited
        || target.updated_at != update.updated_at;
    target.body = update.body.clone();
    target.edited = update.edited;
    target.updated_at = update.updated_at;
    changed
}
