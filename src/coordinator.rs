//! Local writes: optimistic sends, author-checked edits and deletes.

use crate::chat::{Draft, LocalId, Message, MessageId};
use crate::entity::UserId;
use crate::error::{SyncError, SyncResult};
use crate::remote::MessageLog;
use crate::view::ViewHandle;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Issues the current user's writes against the log and keeps the view's
/// optimistic state in step with the outcome.
///
/// Nothing is retried automatically: failures are returned for the caller
/// to surface and retry by hand.
#[derive(Clone)]
pub struct WriteCoordinator {
    log: Arc<dyn MessageLog>,
    view: ViewHandle,
    user: UserId,
}

impl WriteCoordinator {
    pub fn new(log: Arc<dyn MessageLog>, view: ViewHandle, user: UserId) -> Self {
        Self { log, view, user }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Show the message immediately, then create it remotely.
    ///
    /// Rejected with `SendInFlight` while a previous send is unresolved.
    pub async fn send(&self, body: &str) -> SyncResult<Message> {
        let body = non_empty(body)?;
        let scope = self.view.scope();
        let local_id = LocalId::new();

        self.view
            .optimistic_insert(local_id, Draft::new(self.user.clone(), body))
            .await?;
        debug!(local_id = %local_id, scope = %scope, "Provisional message shown");

        match self.log.create_message(&scope, &self.user, body).await {
            Ok(record) => {
                match self.view.confirm_optimistic(local_id, record.clone()).await {
                    Ok(_) => {}
                    // The view moved to another scope while we waited
                    Err(SyncError::UnknownLocalId(_)) => {
                        debug!(local_id = %local_id, "Confirmation for superseded provisional discarded");
                    }
                    Err(e) => return Err(e),
                }
                info!(message_id = %record.id, scope = %scope, "Message sent");
                Ok(record)
            }
            Err(err) => {
                warn!(local_id = %local_id, error = %err, "Send failed, rolling back");
                match self.view.fail_optimistic(local_id, err.kind()).await {
                    Ok(_) | Err(SyncError::UnknownLocalId(_)) => {}
                    Err(e) => return Err(e),
                }
                Err(err)
            }
        }
    }

    /// Change the body of one of the user's messages.
    ///
    /// The view only shows the edit once the feed delivers the update.
    pub async fn edit(&self, id: &MessageId, new_body: &str) -> SyncResult<()> {
        let body = non_empty(new_body)?;
        let message = self
            .view
            .snapshot()
            .find(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        self.ensure_author(&message)?;

        self.log.update_message(id, body).await?;
        info!(message_id = %id, "Edit submitted");
        Ok(())
    }

    /// Delete one of the user's messages.
    ///
    /// The message is hidden right away; the feed delete removes it for good.
    /// Deleting something that is already gone succeeds.
    pub async fn remove(&self, id: &MessageId) -> SyncResult<()> {
        let Some(message) = self.view.snapshot().find(id).cloned() else {
            debug!(message_id = %id, "Delete of unknown message is a no-op");
            return Ok(());
        };
        self.ensure_author(&message)?;

        self.view.hide(id.clone()).await?;
        match self.log.delete_message(id, &self.user).await {
            Ok(()) | Err(SyncError::NotFound(_)) => {
                info!(message_id = %id, "Message deleted");
                Ok(())
            }
            Err(err) => {
                warn!(message_id = %id, error = %err, "Delete failed, restoring message");
                self.view.unhide(id.clone()).await?;
                Err(err)
            }
        }
    }

    fn ensure_author(&self, message: &Message) -> SyncResult<()> {
        if message.author_id != self.user {
            warn!(message_id = %message.id, user_id = %self.user, "Refusing to modify another user's message");
            return Err(SyncError::Unauthorized(format!(
                "{} is not the author of {}",
                self.user, message.id
            )));
        }
        Ok(())
    }
}

fn non_empty(body: &str) -> SyncResult<&str> {
    let body = body.trim();
    if body.is_empty() {
        Err(SyncError::EmptyBody)
    } else {
        Ok(body)
    }
}
