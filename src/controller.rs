//! The task list controller.
//!
//! [`SyncController`] keeps an observable [`TaskView`] in step with the
//! current ownership scope. A driver task, spawned on
//! [`mount`](SyncController::mount), processes one event at a time:
//!
//! - a scope change closes the open subscription, re-lists under the new
//!   key and opens a subscription bound to the new generation;
//! - a [`FeedSignal::Changed`] from the current subscription triggers a full
//!   resync; signals from superseded subscriptions are dropped;
//! - a [`FeedSignal::Disconnected`] marks the feed as lost and, if a
//!   reconnect policy is configured, schedules a reconnect attempt;
//! - a due reconnect attempt re-opens the feed or schedules the next one;
//! - cancellation closes the subscription and stops.
//!
//! Each event is handled to completion before cancellation is observed, so
//! a subscription opened or closed mid-step is never orphaned. Reconnect
//! backoff is waited out between events, never inside one, so a scope
//! change is picked up while a reconnect is pending.
//!
//! Mutations run on the caller's task. The local list is only updated after
//! the store confirms, and only if the scope has not changed in the meantime.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use taskscope::config::SyncConfig;
//! use taskscope::controller::SyncController;
//! use taskscope::ownership::{OwnershipContext, OwnershipScope};
//! use taskscope::store::InMemoryTaskStore;
//! use taskscope::view::SyncPhase;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let ownership = OwnershipContext::resolved(OwnershipScope::personal("U1"));
//! let controller =
//!     SyncController::mount(&SyncConfig::default(), ownership, store.clone(), store.clone());
//!
//! let mut view = controller.watch();
//! view.wait_for(|v| v.phase == SyncPhase::Ready).await.unwrap();
//!
//! controller.create("Buy milk", None).await.unwrap();
//! assert_eq!(controller.snapshot().titles(), vec!["Buy milk"]);
//!
//! controller.shutdown().await;
//! assert_eq!(store.active_subscriptions(), 0);
//! # });
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RetryPolicy, SyncConfig};
use crate::domain::Task;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeedSubscriber, FeedConfig, FeedSignal, Subscription};
use crate::ownership::{OwnershipContext, ScopeSnapshot};
use crate::repository::{DeleteOutcome, ScopedRepository};
use crate::store::{ChangeFeedTransport, TaskStore};
use crate::view::{FeedStatus, FlowState, SyncPhase, TaskView};

#[derive(Debug, Clone, Copy)]
enum Flow {
    Create,
    Toggle,
    Delete,
}

impl Flow {
    fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Toggle => "toggle",
            Self::Delete => "delete",
        }
    }

    fn state(self, view: &mut TaskView) -> &mut FlowState {
        match self {
            Self::Create => &mut view.create,
            Self::Toggle => &mut view.toggle,
            Self::Delete => &mut view.delete,
        }
    }
}

enum Step {
    Rescope(ScopeSnapshot),
    Signal(FeedSignal),
    Reconnect(Reconnect),
}

/// A scheduled attempt to re-open a dropped feed.
#[derive(Debug, Clone, Copy)]
struct Reconnect {
    generation: u64,
    attempt: u32,
    due: Instant,
}

impl Reconnect {
    fn first(generation: u64, policy: &RetryPolicy) -> Self {
        Self {
            generation,
            attempt: 1,
            due: Instant::now() + policy.backoff(1),
        }
    }

    fn next(self, policy: &RetryPolicy) -> Option<Self> {
        if self.attempt >= policy.max_attempts {
            return None;
        }
        let attempt = self.attempt + 1;
        Some(Self {
            generation: self.generation,
            attempt,
            due: Instant::now() + policy.backoff(attempt),
        })
    }
}

struct Shared {
    repository: ScopedRepository,
    feed: ChangeFeedSubscriber,
    reconnect: Option<RetryPolicy>,
    view: watch::Sender<TaskView>,
    subscription: AsyncMutex<Option<Subscription>>,
    signals: mpsc::UnboundedSender<FeedSignal>,
}

/// Keeps a [`TaskView`] synchronized with the current ownership scope.
///
/// Dropping the controller cancels the driver, which closes the open
/// subscription in the background. Prefer [`shutdown`](Self::shutdown) to
/// wait for that to finish.
pub struct SyncController {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("repository", &self.shared.repository)
            .field("feed", &self.shared.feed)
            .field("reconnect", &self.shared.reconnect)
            .finish_non_exhaustive()
    }
}

impl SyncController {
    /// Builds the repository and feed subscriber from `config` and starts
    /// the driver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn mount(
        config: &SyncConfig,
        ownership: OwnershipContext,
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn ChangeFeedTransport>,
    ) -> Self {
        let repository = ScopedRepository::new(store, ownership)
            .with_owner_stamp(config.owner_stamp)
            .with_list_retry(config.list_retry);
        let feed = ChangeFeedSubscriber::new(transport, FeedConfig::from(config));
        Self::with_parts(repository, feed, config.reconnect)
    }

    /// Starts the driver over an existing repository and feed subscriber.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_parts(
        repository: ScopedRepository,
        feed: ChangeFeedSubscriber,
        reconnect: Option<RetryPolicy>,
    ) -> Self {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (view, _) = watch::channel(TaskView::default());
        let scopes = repository.ownership().subscribe();
        let shared = Arc::new(Shared {
            repository,
            feed,
            reconnect,
            view,
            subscription: AsyncMutex::new(None),
            signals,
        });
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            scopes,
            signal_rx,
            cancel.clone(),
        ));
        tracing::debug!("sync controller mounted");
        Self {
            shared,
            cancel,
            driver: Some(driver),
        }
    }

    /// The ownership context the controller follows.
    pub fn ownership(&self) -> &OwnershipContext {
        self.shared.repository.ownership()
    }

    /// The underlying scoped repository.
    pub fn repository(&self) -> &ScopedRepository {
        &self.shared.repository
    }

    /// The current view.
    pub fn snapshot(&self) -> TaskView {
        self.shared.view.borrow().clone()
    }

    /// A receiver notified on every view change.
    pub fn watch(&self) -> watch::Receiver<TaskView> {
        self.shared.view.subscribe()
    }

    /// Re-reads the current scope's tasks. If the change feed is
    /// [`Disconnected`](FeedStatus::Disconnected), re-opens it first.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::Repository`] if the list fails; also recorded in the
    ///   view's `list_error`.
    pub async fn refresh(&self) -> Result<()> {
        let (key, generation) = self.ownership().current_key()?;
        let (feed, view_generation) = {
            let view = self.shared.view.borrow();
            (view.feed, view.generation)
        };
        if feed == FeedStatus::Disconnected && view_generation == generation {
            tracing::info!(generation, "re-establishing change feed");
            self.shared.open_subscription(generation, &key).await;
        }
        self.shared.resync().await
    }

    /// Creates a task in the current scope and prepends it to the list.
    ///
    /// If the scope changed while the store call was in flight the task is
    /// still created (under the scope it was issued in) but not shown.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] for a blank title; the store is not
    ///   called.
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn create(&self, title: &str, description: Option<String>) -> Result<Task> {
        self.shared.settle(Flow::Create, FlowState::InFlight);
        let created = match self.shared.repository.create(title, description).await {
            Ok(created) => created,
            Err(err) => return Err(self.shared.fail(Flow::Create, err)),
        };

        let generation = created.generation;
        let task = created.into_inner();
        let shown = task.clone();
        let applied = self.shared.apply_if_current(generation, |view| {
            if view.task(&shown.id).is_none() {
                view.tasks.insert(0, shown);
            }
        });
        if !applied {
            tracing::debug!(task_id = %task.id, generation, "scope changed during create, not shown");
        }
        self.shared.settle(Flow::Create, FlowState::Succeeded);
        Ok(task)
    }

    /// Sets a task's completion flag and updates it in the list once the
    /// store confirms.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::NotFound`] if the task does not exist.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn set_completion(&self, id: &str, completed: bool) -> Result<Task> {
        self.shared.settle(Flow::Toggle, FlowState::InFlight);
        let updated = match self.shared.repository.set_completion(id, completed).await {
            Ok(updated) => updated,
            Err(err) => return Err(self.shared.fail(Flow::Toggle, err)),
        };

        let generation = updated.generation;
        let key = updated.key.clone();
        let task = updated.into_inner();
        let replacement = task.clone();
        self.shared.apply_if_current(generation, |view| {
            let Some(index) = view.tasks.iter().position(|t| t.id == replacement.id) else {
                return;
            };
            if replacement.owner_id == key {
                view.tasks[index] = replacement;
            } else {
                view.tasks.remove(index);
            }
        });
        self.shared.settle(Flow::Toggle, FlowState::Succeeded);
        Ok(task)
    }

    /// Deletes a task in the current scope and removes it from the list once
    /// the store confirms.
    ///
    /// A task outside the current scope is left alone and
    /// [`DeleteOutcome::OutOfScope`] is returned.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        self.shared.settle(Flow::Delete, FlowState::InFlight);
        let deleted = match self.shared.repository.delete(id).await {
            Ok(deleted) => deleted,
            Err(err) => return Err(self.shared.fail(Flow::Delete, err)),
        };

        if deleted.value == DeleteOutcome::Deleted {
            self.shared
                .apply_if_current(deleted.generation, |view| view.tasks.retain(|t| t.id != id));
        }
        self.shared.settle(Flow::Delete, FlowState::Succeeded);
        Ok(deleted.value)
    }

    /// Stops the driver and waits for it to close the open subscription.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            if let Err(err) = driver.await {
                tracing::warn!(error = %err, "sync driver did not stop cleanly");
            }
        }
        tracing::debug!("sync controller shut down");
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut scopes: watch::Receiver<ScopeSnapshot>,
    mut signals: mpsc::UnboundedReceiver<FeedSignal>,
    cancel: CancellationToken,
) {
    let mut step = Step::Rescope(scopes.borrow_and_update().clone());
    let mut pending: Option<Reconnect> = None;
    loop {
        // Steps run to completion; cancellation is checked between them.
        match step {
            Step::Rescope(snapshot) => {
                pending = None;
                shared.rescope(snapshot).await;
            },
            Step::Signal(FeedSignal::Changed { generation }) => {
                shared.on_changed(generation).await;
            },
            Step::Signal(FeedSignal::Disconnected { generation }) => {
                if let Some(scheduled) = shared.on_disconnected(generation).await {
                    pending = Some(scheduled);
                }
            },
            Step::Reconnect(due) => pending = shared.reconnect(due).await,
        }

        // Scope changes take priority over reconnects and queued feed signals.
        step = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = scopes.changed() => match changed {
                Ok(()) => Step::Rescope(scopes.borrow_and_update().clone()),
                Err(_) => break,
            },
            due = reconnect_due(pending) => Step::Reconnect(due),
            Some(signal) = signals.recv() => Step::Signal(signal),
        };
    }
    shared.close_subscription().await;
    shared.view.send_modify(|view| view.feed = FeedStatus::Idle);
}

async fn reconnect_due(pending: Option<Reconnect>) -> Reconnect {
    match pending {
        Some(reconnect) => {
            tokio::time::sleep_until(reconnect.due).await;
            reconnect
        },
        None => std::future::pending().await,
    }
}

impl Shared {
    fn ownership(&self) -> &OwnershipContext {
        self.repository.ownership()
    }

    async fn on_changed(&self, generation: u64) {
        if self.is_bound(generation).await {
            // Failures are recorded in the view.
            let _ = self.resync().await;
        } else {
            tracing::debug!(generation, "dropping signal from superseded subscription");
        }
    }

    /// Applies `apply` only if the view and the ownership context are both
    /// still at `generation`.
    fn apply_if_current(&self, generation: u64, apply: impl FnOnce(&mut TaskView)) -> bool {
        let ownership = self.ownership();
        self.view.send_if_modified(|view| {
            if view.generation != generation || !ownership.is_current(generation) {
                return false;
            }
            apply(view);
            true
        })
    }

    fn settle(&self, flow: Flow, state: FlowState) {
        self.view.send_modify(|view| *flow.state(view) = state);
    }

    fn fail(&self, flow: Flow, err: SyncError) -> SyncError {
        tracing::warn!(flow = flow.name(), error = %err, "task operation failed");
        self.settle(flow, FlowState::Failed(err.user_message()));
        err
    }

    async fn rescope(&self, snapshot: ScopeSnapshot) {
        self.close_subscription().await;
        let generation = snapshot.generation;

        let Some(scope) = snapshot.scope else {
            self.view.send_modify(|view| {
                view.phase = SyncPhase::Uninitialized;
                view.tasks.clear();
                view.scope = None;
                view.generation = generation;
                view.list_error = None;
                view.feed = FeedStatus::Idle;
            });
            tracing::debug!(generation, "no scope, list cleared");
            return;
        };

        tracing::debug!(generation, scope = %scope, "rescoping task list");
        let bound = scope.clone();
        self.view.send_modify(|view| {
            view.phase = SyncPhase::Loading;
            view.scope = Some(bound);
            view.generation = generation;
            view.feed = FeedStatus::Idle;
        });

        match self.repository.list().await {
            Ok(listed) if listed.generation == generation => {
                let applied = self.apply_if_current(generation, |view| {
                    view.tasks = listed.value;
                    view.phase = SyncPhase::Ready;
                    view.list_error = None;
                });
                if !applied {
                    return;
                }
            },
            Ok(_) | Err(SyncError::AuthContext) => {
                tracing::debug!(generation, "scope changed while listing, result discarded");
                return;
            },
            Err(err) => {
                let message = err.user_message();
                let applied = self.apply_if_current(generation, |view| {
                    view.phase = SyncPhase::Error;
                    view.list_error = Some(message);
                });
                if !applied {
                    return;
                }
            },
        }

        self.open_subscription(generation, scope.key()).await;
    }

    async fn resync(&self) -> Result<()> {
        let generation = self.ownership().generation();
        match self.repository.list().await {
            Ok(listed) => {
                let listed_generation = listed.generation;
                let applied = self.apply_if_current(listed_generation, |view| {
                    view.tasks = listed.value;
                    view.phase = SyncPhase::Ready;
                    view.list_error = None;
                });
                if !applied {
                    tracing::debug!(generation = listed_generation, "discarding stale list result");
                }
                Ok(())
            },
            Err(SyncError::AuthContext) => Err(SyncError::AuthContext),
            Err(err) => {
                let message = err.user_message();
                self.apply_if_current(generation, |view| {
                    view.phase = SyncPhase::Error;
                    view.list_error = Some(message);
                });
                Err(err)
            },
        }
    }

    async fn is_bound(&self, generation: u64) -> bool {
        let bound = self
            .subscription
            .lock()
            .await
            .as_ref()
            .map(Subscription::generation);
        bound == Some(generation) && self.ownership().is_current(generation)
    }

    /// Replaces whatever is in the subscription slot with a fresh
    /// subscription bound to `generation`.
    async fn open_subscription(&self, generation: u64, key: &str) -> bool {
        let mut slot = self.subscription.lock().await;
        if !self.ownership().is_current(generation) {
            return false;
        }
        if let Some(previous) = slot.take() {
            close(previous).await;
        }
        match self.feed.subscribe(generation, key, self.signals.clone()).await {
            Ok(subscription) => {
                *slot = Some(subscription);
                drop(slot);
                self.apply_if_current(generation, |view| view.feed = FeedStatus::Live);
                true
            },
            Err(err) => {
                drop(slot);
                tracing::warn!(generation, error = %err, "failed to open change feed");
                self.apply_if_current(generation, |view| view.feed = FeedStatus::Disconnected);
                false
            },
        }
    }

    async fn close_subscription(&self) {
        let previous = self.subscription.lock().await.take();
        if let Some(subscription) = previous {
            close(subscription).await;
        }
    }

    /// Releases a dropped subscription and returns the first reconnect
    /// attempt, if a policy is configured.
    async fn on_disconnected(&self, generation: u64) -> Option<Reconnect> {
        let dead = {
            let mut slot = self.subscription.lock().await;
            let lost = slot
                .as_ref()
                .is_some_and(|s| s.generation() == generation && s.is_disconnected());
            if !lost {
                return None;
            }
            slot.take()
        };
        if let Some(subscription) = dead {
            close(subscription).await;
        }
        self.apply_if_current(generation, |view| view.feed = FeedStatus::Disconnected);

        let policy = self.reconnect?;
        Some(Reconnect::first(generation, &policy))
    }

    /// Makes one reconnect attempt. Returns the next attempt if this one
    /// failed and the policy allows another.
    async fn reconnect(&self, due: Reconnect) -> Option<Reconnect> {
        let policy = self.reconnect?;
        let Reconnect {
            generation,
            attempt,
            ..
        } = due;
        let (key, current) = self.ownership().current_key().ok()?;
        if current != generation {
            return None;
        }
        if self.subscription.lock().await.is_some() {
            tracing::debug!(generation, "change feed already re-opened");
            return None;
        }
        if self.open_subscription(generation, &key).await {
            tracing::info!(generation, attempt, "change feed reconnected");
            // Events may have been missed while disconnected.
            let _ = self.resync().await;
            return None;
        }
        let next = due.next(&policy);
        if next.is_none() {
            tracing::warn!(
                generation,
                attempts = policy.max_attempts,
                "giving up reconnecting change feed"
            );
        }
        next
    }
}

async fn close(subscription: Subscription) {
    let id = subscription.id();
    if let Err(err) = subscription.close().await {
        tracing::warn!(subscription = %id, error = %err, "failed to close change feed");
    }
}
