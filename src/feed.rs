//! Change feed subscriptions, one per conversation scope.

use crate::chat::{FeedEvent, ScopeTag};
use crate::error::SyncError;
use crate::remote::ChangeFeed;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a subscription reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Event(ScopeTag, FeedEvent),
    /// The stream failed or ended; the owner should reconnect and refetch.
    ConnectionLost(ScopeTag, SyncError),
}

impl FeedSignal {
    pub fn tag(&self) -> &ScopeTag {
        match self {
            FeedSignal::Event(tag, _) | FeedSignal::ConnectionLost(tag, _) => tag,
        }
    }
}

/// An open change-feed connection. Closing it (or dropping it) stops delivery.
pub struct SubscriptionHandle {
    tag: ScopeTag,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn tag(&self) -> &ScopeTag {
        &self.tag
    }

    /// Whether events can still arrive. False for a degraded subscription
    /// whose feed could not be opened.
    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop delivery. After this returns no further callback runs.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancelled or finished, either way the callback is done
            let _ = task.await;
        }
        debug!(tag = %self.tag, "Subscription closed");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens change-feed subscriptions and forwards their events, tagged with the
/// scope entry they belong to.
#[derive(Clone)]
pub struct FeedSubscriber {
    feed: Arc<dyn ChangeFeed>,
}

impl FeedSubscriber {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self { feed }
    }

    /// Subscribe to `tag.scope` and call `on_signal` for each event.
    ///
    /// If the feed cannot be opened the handle is returned without a task:
    /// the view degrades to "no live events" and relies on refetches.
    pub async fn open<F>(&self, tag: ScopeTag, on_signal: F) -> SubscriptionHandle
    where
        F: Fn(FeedSignal) + Send + Sync + 'static,
    {
        let mut stream = match self.feed.subscribe(&tag.scope).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(tag = %tag, error = %e, "Could not open change feed, continuing without live events");
                return SubscriptionHandle { tag, task: None };
            }
        };

        info!(tag = %tag, "Subscribed to change feed");
        let task_tag = tag.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => on_signal(FeedSignal::Event(task_tag.clone(), event)),
                    Err(e) => {
                        warn!(tag = %task_tag, error = %e, "Change feed failed");
                        on_signal(FeedSignal::ConnectionLost(task_tag.clone(), e));
                        return;
                    }
                }
            }
            on_signal(FeedSignal::ConnectionLost(
                task_tag.clone(),
                SyncError::ConnectionLost("change feed ended".to_string()),
            ));
        });

        SubscriptionHandle {
            tag,
            task: Some(task),
        }
    }
}
