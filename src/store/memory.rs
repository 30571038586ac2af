//! In-memory task store and change-feed transport.
//!
//! [`InMemoryTaskStore`] implements both [`TaskStore`] and
//! [`ChangeFeedTransport`] over a `DashMap`, so a single instance plays the
//! role of the remote database plus its realtime channel. Every mutation
//! broadcasts a payload-less [`ChangeEvent`] to every open subscription on
//! the collection (optionally narrowed by a server-side owner filter).
//!
//! It also carries the knobs tests need to exercise failure paths:
//! injected query failures, a gate that holds queries in flight, and
//! simulated connection drops.
//!
//! # Examples
//!
//! ```
//! use taskscope::domain::NewTask;
//! use taskscope::store::{InMemoryTaskStore, TaskStore};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryTaskStore::new();
//! let task = store
//!     .insert("U1", NewTask::new("Buy milk", None).unwrap())
//!     .await
//!     .unwrap();
//! let listed = store.select_by_owner("U1").await.unwrap();
//! assert_eq!(listed, vec![task]);
//! assert!(store.select_by_owner("O1").await.unwrap().is_empty());
//! # });
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::domain::{NewTask, Task, TaskPatch};

use super::{
    ChangeEvent, ChangeFeedTransport, ChangeKind, ChannelSpec, FeedSubscription, StorageError,
    SubscriptionId, TaskStore,
};

/// Default name of the tracked collection.
pub const DEFAULT_COLLECTION: &str = "tasks";

const DEFAULT_FEED_CAPACITY: usize = 64;

#[derive(Debug)]
struct Channel {
    spec: ChannelSpec,
    sender: broadcast::Sender<ChangeEvent>,
}

/// Thread-safe in-memory store plus change feed.
///
/// Rows are keyed by task ID. Timestamps are strictly increasing across
/// writes so `created_at` ordering is deterministic even for back-to-back
/// inserts.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    collection: String,
    rows: DashMap<String, Task>,
    channels: DashMap<SubscriptionId, Channel>,
    next_subscription: AtomicU64,
    feed_capacity: usize,
    last_stamp: Mutex<DateTime<Utc>>,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    gate: watch::Sender<bool>,
    held: AtomicUsize,
    select_calls: AtomicUsize,
}

impl InMemoryTaskStore {
    /// Creates an empty store tracking the `tasks` collection.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            rows: DashMap::new(),
            channels: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            last_stamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
            unavailable: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            gate,
            held: AtomicUsize::new(0),
            select_calls: AtomicUsize::new(0),
        }
    }

    /// Sets the tracked collection name.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Sets the per-subscription event buffer.
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity.max(1);
        self
    }

    /// Number of stored rows across all owners.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reads a row regardless of owner.
    pub fn row(&self, id: &str) -> Option<Task> {
        self.rows.get(id).map(|entry| entry.value().clone())
    }

    /// Makes every query fail with [`StorageError::Unavailable`] until reset.
    /// Subscribing fails too.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails the next `n` queries with [`StorageError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Holds every query at its start until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    /// Releases held queries.
    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Number of queries currently held by [`pause`](Self::pause).
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    /// Number of `select_by_owner` calls served so far, failed ones included.
    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.channels.len()
    }

    /// Specs of the open subscriptions, ordered by subscription ID.
    pub fn subscriptions(&self) -> Vec<(SubscriptionId, ChannelSpec)> {
        let mut subs: Vec<_> = self
            .channels
            .iter()
            .map(|entry| (*entry.key(), entry.value().spec.clone()))
            .collect();
        subs.sort_by_key(|(id, _)| *id);
        subs
    }

    /// Simulates a transport-side connection drop: every open subscription
    /// is discarded and its event stream ends. Returns how many were dropped.
    pub fn drop_connections(&self) -> usize {
        let dropped = self.channels.len();
        self.channels.clear();
        tracing::debug!(dropped, "dropped change-feed connections");
        dropped
    }

    async fn admit(&self) -> Result<(), StorageError> {
        let mut gate = self.gate.subscribe();
        if !*gate.borrow_and_update() {
            self.held.fetch_add(1, Ordering::SeqCst);
            let _ = gate.wait_for(|open| *open).await;
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
        self.check_fault()
    }

    fn check_fault(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                message: "store is offline".to_string(),
            });
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Unavailable {
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock();
        let now = Utc::now().max(*last + Duration::microseconds(1));
        *last = now;
        now
    }

    fn notify(&self, kind: ChangeKind, owners: &[&str]) {
        for entry in self.channels.iter() {
            let channel = entry.value();
            if channel.spec.collection != self.collection {
                continue;
            }
            if let Some(filter) = &channel.spec.owner_filter {
                if !owners.contains(&filter.as_str()) {
                    continue;
                }
            }
            // No receivers left is fine: the subscriber is closing.
            let _ = channel.sender.send(ChangeEvent {
                kind,
                collection: self.collection.clone(),
            });
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, owner_id: &str, task: NewTask) -> Result<Task, StorageError> {
        self.admit().await?;
        let row = Task::from_insert(task, owner_id, self.stamp());
        self.rows.insert(row.id.clone(), row.clone());
        self.notify(ChangeKind::Insert, &[owner_id]);
        Ok(row)
    }

    async fn select_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StorageError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.admit().await?;
        let mut tasks: Vec<Task> = self
            .rows
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(Task::newest_first);
        Ok(tasks)
    }

    async fn select_one(&self, id: &str, owner_id: &str) -> Result<Option<Task>, StorageError> {
        self.admit().await?;
        Ok(self
            .rows
            .get(id)
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().clone()))
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>, StorageError> {
        self.admit().await?;
        let now = self.stamp();
        let Some((previous_owner, updated)) = self.rows.get_mut(id).map(|mut entry| {
            let previous_owner = entry.owner_id.clone();
            entry.apply(&patch, now);
            (previous_owner, entry.clone())
        }) else {
            return Ok(None);
        };
        self.notify(
            ChangeKind::Update,
            &[previous_owner.as_str(), updated.owner_id.as_str()],
        );
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str, owner_id: &str) -> Result<u64, StorageError> {
        self.admit().await?;
        let removed = self
            .rows
            .remove_if(id, |_, row| row.owner_id == owner_id)
            .is_some();
        if !removed {
            return Ok(0);
        }
        self.notify(ChangeKind::Delete, &[owner_id]);
        Ok(1)
    }
}

#[async_trait]
impl ChangeFeedTransport for InMemoryTaskStore {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<FeedSubscription, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                message: "realtime channel is offline".to_string(),
            });
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, events) = broadcast::channel(self.feed_capacity);
        tracing::debug!(subscription = %id, channel = %spec.channel, "opened subscription");
        self.channels.insert(id, Channel { spec, sender });
        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, StorageError> {
        Ok(self.channels.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn new_task(title: &str) -> NewTask {
        NewTask::new(title, None).unwrap()
    }

    fn spec(owner_filter: Option<&str>) -> ChannelSpec {
        ChannelSpec {
            channel: "tasks_changes".to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            owner_filter: owner_filter.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn insert_assigns_distinct_ids_and_increasing_timestamps() {
        let store = InMemoryTaskStore::new();
        let a = store.insert("U1", new_task("a")).await.unwrap();
        let b = store.insert("U1", new_task("b")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(b.created_at > a.created_at);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn select_by_owner_filters_and_orders_newest_first() {
        let store = InMemoryTaskStore::new();
        let first = store.insert("U1", new_task("first")).await.unwrap();
        store.insert("O1", new_task("other")).await.unwrap();
        let second = store.insert("U1", new_task("second")).await.unwrap();

        let listed = store.select_by_owner("U1").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(store.select_calls(), 1);
    }

    #[tokio::test]
    async fn select_one_is_owner_filtered() {
        let store = InMemoryTaskStore::new();
        let task = store.insert("U1", new_task("a")).await.unwrap();
        assert!(store.select_one(&task.id, "U1").await.unwrap().is_some());
        assert!(store.select_one(&task.id, "O1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_ignores_owner_and_returns_none_for_missing() {
        let store = InMemoryTaskStore::new();
        let task = store.insert("U1", new_task("a")).await.unwrap();
        let patch = TaskPatch {
            is_completed: true,
            owner_id: Some("O1".to_string()),
        };
        let updated = store.update(&task.id, patch.clone()).await.unwrap().unwrap();
        assert!(updated.is_completed);
        assert_eq!(updated.owner_id, "O1");
        assert!(updated.updated_at > task.updated_at);

        assert!(store.update("missing", patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_requires_owner_match() {
        let store = InMemoryTaskStore::new();
        let task = store.insert("U1", new_task("a")).await.unwrap();
        assert_eq!(store.delete(&task.id, "O1").await.unwrap(), 0);
        assert!(store.row(&task.id).is_some());
        assert_eq!(store.delete(&task.id, "U1").await.unwrap(), 1);
        assert!(store.is_empty());
        assert_eq!(store.delete(&task.id, "U1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fail_next_fails_exactly_n_queries() {
        let store = InMemoryTaskStore::new();
        store.fail_next(2);
        assert!(store.select_by_owner("U1").await.is_err());
        assert!(store.select_by_owner("U1").await.is_err());
        assert!(store.select_by_owner("U1").await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_blocks_queries_and_subscriptions() {
        let store = InMemoryTaskStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.insert("U1", new_task("a")).await,
            Err(StorageError::Unavailable { .. })
        ));
        assert!(store.subscribe(spec(None)).await.is_err());
        store.set_unavailable(false);
        assert!(store.insert("U1", new_task("a")).await.is_ok());
    }

    #[tokio::test]
    async fn unfiltered_subscription_sees_every_owner() {
        let store = InMemoryTaskStore::new();
        let mut sub = store.subscribe(spec(None)).await.unwrap();
        store.insert("U1", new_task("a")).await.unwrap();
        store.insert("O9", new_task("b")).await.unwrap();
        assert_eq!(sub.events.recv().await.unwrap().kind, ChangeKind::Insert);
        assert_eq!(sub.events.recv().await.unwrap().kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn owner_filter_narrows_events() {
        let store = InMemoryTaskStore::new();
        let mut sub = store.subscribe(spec(Some("U1"))).await.unwrap();
        store.insert("O9", new_task("b")).await.unwrap();
        assert!(matches!(sub.events.try_recv(), Err(TryRecvError::Empty)));

        let task = store.insert("U1", new_task("a")).await.unwrap();
        assert_eq!(sub.events.recv().await.unwrap().kind, ChangeKind::Insert);

        // A restamp away from U1 is still visible to U1's filter.
        store
            .update(
                &task.id,
                TaskPatch {
                    is_completed: true,
                    owner_id: Some("O9".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(sub.events.recv().await.unwrap().kind, ChangeKind::Update);
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_connections() {
        let store = InMemoryTaskStore::new();
        let a = store.subscribe(spec(None)).await.unwrap();
        let mut b = store.subscribe(spec(None)).await.unwrap();
        assert_eq!(store.active_subscriptions(), 2);

        assert!(store.unsubscribe(a.id).await.unwrap());
        assert!(!store.unsubscribe(a.id).await.unwrap());
        assert_eq!(store.active_subscriptions(), 1);

        assert_eq!(store.drop_connections(), 1);
        assert!(matches!(
            b.events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn pause_holds_queries_until_resume() {
        let store = std::sync::Arc::new(InMemoryTaskStore::new());
        store.pause();
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.select_by_owner("U1").await }
        });
        while store.held() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());
        store.resume();
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(store.held(), 0);
    }
}
