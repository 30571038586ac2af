//! Remote store and change-feed transport seams.
//!
//! # Architecture
//!
//! The sync core talks to two external collaborators, both modeled as
//! object-safe async traits so they can be held as `Arc<dyn ...>`:
//!
//! 1. **[`TaskStore`]** -- authenticated query execution against the single
//!    logical `tasks` collection. Dumb row operations only: owner filtering
//!    is expressed in the arguments, never decided by the store.
//!
//! 2. **[`ChangeFeedTransport`]** -- a subscribe/unsubscribe primitive keyed
//!    by channel and collection, yielding payload-less [`ChangeEvent`]s.
//!
//! Scoping policy (which key to filter by, when to re-stamp owners) lives in
//! [`ScopedRepository`](crate::repository::ScopedRepository), not here.
//!
//! # Backends
//!
//! - [`InMemoryTaskStore`](memory::InMemoryTaskStore) -- implements both
//!   traits over a `DashMap`, with failure injection for tests.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{NewTask, Task, TaskPatch};

pub use memory::InMemoryTaskStore;

/// Errors reported by the remote store or change-feed transport.
///
/// The repository wraps these in
/// [`SyncError::Repository`](crate::SyncError::Repository) together with
/// the operation that failed.
///
/// # Examples
///
/// ```
/// use taskscope::store::StorageError;
///
/// let err = StorageError::Unavailable { message: "timeout".to_string() };
/// assert_eq!(err.to_string(), "store unavailable: timeout");
/// ```
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be reached (network failure, timeout).
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Human-readable description.
        message: String,
    },

    /// The store refused the request for the presented credentials.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Human-readable description.
        message: String,
    },

    /// Any other backend-specific failure.
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Kind of mutation a change event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// A "something changed" notification.
///
/// Deliberately carries no row payload and no owner: receivers resync by
/// re-reading the full scoped set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: ChangeKind,
    /// Collection the mutation touched.
    pub collection: String,
}

/// Identifier of an open transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Logical channel name.
    pub channel: String,
    /// Tracked collection.
    pub collection: String,
    /// Server-side owner filter. `None` means every tenant's mutation is
    /// delivered.
    pub owner_filter: Option<String>,
}

/// An open subscription: its ID plus the event stream.
///
/// The stream ends (receiver reports `Closed`) when the transport drops the
/// connection.
#[derive(Debug)]
pub struct FeedSubscription {
    /// Subscription ID used to unsubscribe.
    pub id: SubscriptionId,
    /// Change events for the subscribed collection.
    pub events: broadcast::Receiver<ChangeEvent>,
}

/// Authenticated query execution against the tasks collection.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the repository shares one store
/// between the controller driver and UI-facing calls.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a row stamped with `owner_id` and returns it with
    /// store-assigned ID and timestamps.
    async fn insert(&self, owner_id: &str, task: NewTask) -> Result<Task, StorageError>;

    /// All rows owned by `owner_id`, ordered by `created_at` descending.
    async fn select_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StorageError>;

    /// The row with `id` if it is owned by `owner_id`.
    async fn select_one(&self, id: &str, owner_id: &str) -> Result<Option<Task>, StorageError>;

    /// Applies `patch` to the row with `id`, regardless of owner. Returns the
    /// updated row, or `None` if no row has that ID.
    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>, StorageError>;

    /// Deletes the row matching both `id` and `owner_id`. Returns the number
    /// of rows affected (0 or 1).
    async fn delete(&self, id: &str, owner_id: &str) -> Result<u64, StorageError>;
}

/// Subscribe/unsubscribe primitive of the change feed.
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    /// Opens a subscription.
    async fn subscribe(&self, spec: ChannelSpec) -> Result<FeedSubscription, StorageError>;

    /// Closes a subscription. Returns `false` if it was not open (already
    /// closed, or dropped by the transport).
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, StorageError>;
}
