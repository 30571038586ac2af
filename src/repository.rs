//! Scoped create/read/update/delete over a [`TaskStore`].
//!
//! [`ScopedRepository`] reads the scoping key from the
//! [`OwnershipContext`] at invocation time and attaches it to every store
//! call as a filter (list, get, delete) or a stamp (create, and completion
//! toggles under [`OwnerStampPolicy::Restamp`]). Each result is returned as
//! [`Scoped<T>`], tagged with the generation the call was issued under so
//! callers can discard responses that arrive after a scope change.
//!
//! # Owner isolation
//!
//! Reads and deletes are owner-filtered. A delete targeting another scope's
//! task affects zero rows and reports [`DeleteOutcome::OutOfScope`]; it is a
//! no-op, not an error. Completion toggles look the row up by ID alone, as
//! the store does not enforce scope on update.

use std::sync::Arc;

use crate::config::{OwnerStampPolicy, RetryPolicy};
use crate::domain::{NewTask, Task, TaskPatch};
use crate::error::{Operation, Result, SyncError};
use crate::ownership::OwnershipContext;
use crate::store::TaskStore;

/// A value paired with the scope generation it was produced under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoped<T> {
    /// Generation current when the call was issued.
    pub generation: u64,
    /// Scoping key the call used.
    pub key: String,
    /// The result.
    pub value: T,
}

impl<T> Scoped<T> {
    /// Discards the generation tag.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Result of a scoped delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The task was deleted.
    Deleted,
    /// No task with that ID exists in the current scope; nothing changed.
    OutOfScope,
}

/// Scoped repository over a shared [`TaskStore`].
///
/// Cloning is cheap and shares the store and ownership context.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use taskscope::ownership::{OwnershipContext, OwnershipScope};
/// use taskscope::repository::ScopedRepository;
/// use taskscope::store::InMemoryTaskStore;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let ownership = OwnershipContext::resolved(OwnershipScope::personal("U1"));
/// let repo = ScopedRepository::new(Arc::new(InMemoryTaskStore::new()), ownership);
///
/// let created = repo.create("Buy milk", None).await.unwrap().into_inner();
/// assert_eq!(created.owner_id, "U1");
///
/// let listed = repo.list().await.unwrap().into_inner();
/// assert_eq!(listed, vec![created]);
/// # });
/// ```
#[derive(Clone)]
pub struct ScopedRepository {
    store: Arc<dyn TaskStore>,
    ownership: OwnershipContext,
    owner_stamp: OwnerStampPolicy,
    list_retry: RetryPolicy,
}

impl std::fmt::Debug for ScopedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedRepository")
            .field("ownership", &self.ownership)
            .field("owner_stamp", &self.owner_stamp)
            .field("list_retry", &self.list_retry)
            .finish_non_exhaustive()
    }
}

impl ScopedRepository {
    /// Creates a repository with the default owner stamping policy and no
    /// list retry.
    pub fn new(store: Arc<dyn TaskStore>, ownership: OwnershipContext) -> Self {
        Self {
            store,
            ownership,
            owner_stamp: OwnerStampPolicy::default(),
            list_retry: RetryPolicy::none(),
        }
    }

    /// Sets the owner stamping policy for completion toggles.
    pub fn with_owner_stamp(mut self, policy: OwnerStampPolicy) -> Self {
        self.owner_stamp = policy;
        self
    }

    /// Sets the retry policy for [`list`](Self::list).
    pub fn with_list_retry(mut self, policy: RetryPolicy) -> Self {
        self.list_retry = policy;
        self
    }

    /// The ownership context this repository scopes by.
    pub fn ownership(&self) -> &OwnershipContext {
        &self.ownership
    }

    fn tag<T>(key: String, generation: u64, value: T) -> Scoped<T> {
        Scoped {
            generation,
            key,
            value,
        }
    }

    /// All tasks in the current scope, newest first.
    ///
    /// Retried per the configured [`RetryPolicy`]; retries stop early if the
    /// scope changes, since the result would be discarded anyway.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::Repository`] if every attempt fails.
    pub async fn list(&self) -> Result<Scoped<Vec<Task>>> {
        let (key, generation) = self.ownership.current_key()?;
        tracing::debug!(key = %key, generation, "listing tasks");

        let mut attempt = 1;
        loop {
            match self.store.select_by_owner(&key).await {
                Ok(tasks) => return Ok(Self::tag(key, generation, tasks)),
                Err(err)
                    if attempt < self.list_retry.max_attempts
                        && self.ownership.is_current(generation) =>
                {
                    let delay = self.list_retry.backoff(attempt);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        error = %err,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "list failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => {
                    tracing::warn!(key = %key, attempt, error = %err, "list failed");
                    return Err(SyncError::repository(Operation::List, err));
                },
            }
        }
    }

    /// A single task in the current scope.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::NotFound`] if the task is not in the current scope.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn get(&self, id: &str) -> Result<Scoped<Task>> {
        let (key, generation) = self.ownership.current_key()?;
        let task = self
            .store
            .select_one(id, &key)
            .await
            .map_err(|e| SyncError::repository(Operation::Get, e))?
            .ok_or_else(|| SyncError::NotFound {
                task_id: id.to_string(),
            })?;
        Ok(Self::tag(key, generation, task))
    }

    /// Creates a task stamped with the current scoping key.
    ///
    /// Validation runs before anything else, so a blank title never reaches
    /// the store (and never requires a resolved scope to be reported).
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] if `title` is blank after trimming.
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn create(&self, title: &str, description: Option<String>) -> Result<Scoped<Task>> {
        let new_task = NewTask::new(title, description)?;
        let (key, generation) = self.ownership.current_key()?;
        tracing::debug!(key = %key, generation, "creating task");

        let task = self.store.insert(&key, new_task).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "create failed");
            SyncError::repository(Operation::Create, e)
        })?;
        Ok(Self::tag(key, generation, task))
    }

    /// Sets a task's completion flag.
    ///
    /// Under [`OwnerStampPolicy::Restamp`] the task's `owner_id` becomes the
    /// current scoping key, whatever it was before. Under
    /// [`OwnerStampPolicy::Preserve`] it is left untouched.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::NotFound`] if no task with `id` exists in any scope.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn set_completion(&self, id: &str, completed: bool) -> Result<Scoped<Task>> {
        let (key, generation) = self.ownership.current_key()?;
        let patch = TaskPatch {
            is_completed: completed,
            owner_id: match self.owner_stamp {
                OwnerStampPolicy::Restamp => Some(key.clone()),
                OwnerStampPolicy::Preserve => None,
            },
        };
        tracing::debug!(key = %key, generation, task_id = id, completed, "updating task");

        let updated = self
            .store
            .update(id, patch)
            .await
            .map_err(|e| {
                tracing::warn!(key = %key, task_id = id, error = %e, "update failed");
                SyncError::repository(Operation::SetCompletion, e)
            })?
            .ok_or_else(|| SyncError::NotFound {
                task_id: id.to_string(),
            })?;
        Ok(Self::tag(key, generation, updated))
    }

    /// Deletes a task if it belongs to the current scope.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthContext`] before identity resolution.
    /// - [`SyncError::Repository`] on store failure.
    pub async fn delete(&self, id: &str) -> Result<Scoped<DeleteOutcome>> {
        let (key, generation) = self.ownership.current_key()?;
        tracing::debug!(key = %key, generation, task_id = id, "deleting task");

        let affected = self.store.delete(id, &key).await.map_err(|e| {
            tracing::warn!(key = %key, task_id = id, error = %e, "delete failed");
            SyncError::repository(Operation::Delete, e)
        })?;
        let outcome = if affected == 0 {
            tracing::info!(key = %key, task_id = id, "delete matched no task in scope");
            DeleteOutcome::OutOfScope
        } else {
            DeleteOutcome::Deleted
        };
        Ok(Self::tag(key, generation, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::OwnershipScope;
    use crate::store::InMemoryTaskStore;
    use pretty_assertions::assert_eq;

    fn setup(scope: OwnershipScope) -> (Arc<InMemoryTaskStore>, ScopedRepository) {
        let store = Arc::new(InMemoryTaskStore::new());
        let repo = ScopedRepository::new(store.clone(), OwnershipContext::resolved(scope));
        (store, repo)
    }

    #[tokio::test]
    async fn unresolved_scope_is_auth_context_error() {
        let store = Arc::new(InMemoryTaskStore::new());
        let repo = ScopedRepository::new(store.clone(), OwnershipContext::new());
        assert!(matches!(repo.list().await, Err(SyncError::AuthContext)));
        assert!(matches!(
            repo.create("a", None).await,
            Err(SyncError::AuthContext)
        ));
        assert!(matches!(
            repo.delete("x").await,
            Err(SyncError::AuthContext)
        ));
        assert_eq!(store.select_calls(), 0);
    }

    #[tokio::test]
    async fn blank_title_never_reaches_store() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        let err = repo.create("   ", None).await.unwrap_err();
        assert!(err.is_validation());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn create_and_list_are_scoped() {
        let (_store, repo) = setup(OwnershipScope::personal("U1"));
        let created = repo.create("Buy milk", None).await.unwrap();
        assert_eq!(created.key, "U1");
        assert_eq!(created.generation, 1);

        repo.ownership()
            .publish(Some(OwnershipScope::organization("O1")));
        let listed = repo.list().await.unwrap();
        assert!(listed.value.is_empty());
        assert_eq!(listed.generation, 2);
    }

    #[tokio::test]
    async fn get_is_scoped() {
        let (_store, repo) = setup(OwnershipScope::personal("U1"));
        let task = repo.create("a", None).await.unwrap().into_inner();
        assert_eq!(repo.get(&task.id).await.unwrap().value, task);

        repo.ownership()
            .publish(Some(OwnershipScope::organization("O1")));
        assert!(matches!(
            repo.get(&task.id).await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn set_completion_missing_is_not_found() {
        let (_store, repo) = setup(OwnershipScope::personal("U1"));
        assert!(matches!(
            repo.set_completion("nope", true).await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn set_completion_restamps_by_default() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        let task = repo.create("a", None).await.unwrap().into_inner();

        repo.ownership()
            .publish(Some(OwnershipScope::organization("O1")));
        let updated = repo.set_completion(&task.id, true).await.unwrap().into_inner();
        assert!(updated.is_completed);
        assert_eq!(updated.owner_id, "O1");
        assert_eq!(store.row(&task.id).unwrap().owner_id, "O1");
    }

    #[tokio::test]
    async fn set_completion_preserve_keeps_owner() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        let repo = repo.with_owner_stamp(OwnerStampPolicy::Preserve);
        let task = repo.create("a", None).await.unwrap().into_inner();

        repo.ownership()
            .publish(Some(OwnershipScope::organization("O1")));
        let updated = repo.set_completion(&task.id, true).await.unwrap().into_inner();
        assert_eq!(updated.owner_id, "U1");
        assert_eq!(store.row(&task.id).unwrap().owner_id, "U1");
    }

    #[tokio::test]
    async fn delete_out_of_scope_is_noop() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        let task = repo.create("a", None).await.unwrap().into_inner();

        repo.ownership()
            .publish(Some(OwnershipScope::organization("O1")));
        assert_eq!(
            repo.delete(&task.id).await.unwrap().value,
            DeleteOutcome::OutOfScope
        );
        assert!(store.row(&task.id).is_some());

        repo.ownership()
            .publish(Some(OwnershipScope::personal("U1")));
        assert_eq!(
            repo.delete(&task.id).await.unwrap().value,
            DeleteOutcome::Deleted
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn store_failure_maps_to_repository_error() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        store.set_unavailable(true);
        let err = repo.create("a", None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Repository {
                operation: Operation::Create,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn list_retries_within_policy() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        let repo = repo.with_list_retry(RetryPolicy::new(3, 10, 100));

        store.fail_next(2);
        assert!(repo.list().await.is_ok());
        assert_eq!(store.select_calls(), 3);

        store.fail_next(3);
        assert!(matches!(
            repo.list().await,
            Err(SyncError::Repository {
                operation: Operation::List,
                ..
            })
        ));
        assert_eq!(store.select_calls(), 6);
    }

    #[tokio::test]
    async fn list_without_retry_fails_once() {
        let (store, repo) = setup(OwnershipScope::personal("U1"));
        store.fail_next(1);
        assert!(repo.list().await.is_err());
        assert_eq!(store.select_calls(), 1);
    }
}
