//! Client-side replica of a remote chat message log.
//!
//! A [`view::ConversationView`] keeps one conversation scope in sync from
//! three sources: a bulk fetch, a live change feed and the user's own
//! optimistic writes. [`coordinator::WriteCoordinator`] issues those writes.
//! [`store::Store`] is a SQLite-backed log that serves all remote contracts.

pub mod bus;
pub mod chat;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod entity;
pub mod error;
pub mod feed;
pub mod profile;
pub mod remote;
pub mod store;
pub mod view;

pub use chat::{ConversationScope, EnrichedMessage, FeedEvent, Message, MessageId};
pub use config::SyncConfig;
pub use coordinator::WriteCoordinator;
pub use entity::{Profile, UserId};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use store::Store;
pub use view::{ConversationView, Remote, ViewHandle, ViewSnapshot};
