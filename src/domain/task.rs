//! The tracked task record and its write payloads.
//!
//! [`Task`] is the row as the store returns it. [`NewTask`] is validated
//! creation input, and [`TaskPatch`] is the update payload for completion
//! toggles.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// A task row as stored remotely.
///
/// `id`, `created_at` and `updated_at` are assigned by the store. `owner_id`
/// is the scoping key (personal user ID or organization ID) the row belongs
/// to.
///
/// # Examples
///
/// ```
/// use taskscope::domain::{NewTask, Task};
///
/// let new = NewTask::new("  Buy milk ", None).unwrap();
/// let task = Task::from_insert(new, "U1", chrono::Utc::now());
/// assert_eq!(task.title, "Buy milk");
/// assert_eq!(task.owner_id, "U1");
/// assert!(!task.is_completed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned unique identifier.
    pub id: String,

    /// Non-empty, trimmed title.
    pub title: String,

    /// Optional free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// Completion flag.
    #[serde(default)]
    pub is_completed: bool,

    /// Scoping key of the owning user or organization.
    pub owner_id: String,

    /// Server-assigned creation time. Lists are ordered on it, newest first.
    pub created_at: DateTime<Utc>,

    /// Server-assigned time of the last successful update.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Builds the row a store persists for an insert.
    ///
    /// Assigns a `UUIDv4` ID and sets both timestamps to `now`. Store
    /// implementations call this so that every backend stamps rows the same
    /// way.
    pub fn from_insert(new: NewTask, owner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            is_completed: false,
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an update payload in place and bumps `updated_at`.
    pub fn apply(&mut self, patch: &TaskPatch, now: DateTime<Utc>) {
        self.is_completed = patch.is_completed;
        if let Some(owner) = &patch.owner_id {
            self.owner_id.clone_from(owner);
        }
        self.updated_at = now;
    }

    /// List ordering: `created_at` descending, then `id` descending.
    pub fn newest_first(a: &Task, b: &Task) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    }
}

/// Validated creation input.
///
/// Only constructible through [`NewTask::new`], so a `NewTask` always has a
/// non-blank title. Blank descriptions are normalized to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTask {
    title: String,
    description: Option<String>,
}

impl NewTask {
    /// Validates and normalizes creation input.
    ///
    /// # Errors
    ///
    /// [`SyncError::Validation`] if `title` is empty or whitespace-only.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskscope::domain::NewTask;
    ///
    /// let task = NewTask::new("Plan launch", Some("  ".to_string())).unwrap();
    /// assert_eq!(task.title(), "Plan launch");
    /// assert_eq!(task.description(), None);
    ///
    /// assert!(NewTask::new("   ", None).unwrap_err().is_validation());
    /// ```
    pub fn new(title: &str, description: Option<String>) -> Result<Self, SyncError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::validation("title", "Task title must not be empty"));
        }
        let description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        Ok(Self {
            title: title.to_string(),
            description,
        })
    }

    /// The trimmed title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The normalized description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Update payload for a completion toggle.
///
/// `owner_id` is `Some` when the caller re-stamps ownership with its current
/// scoping key, `None` when the stored owner is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskPatch {
    /// New completion flag.
    pub is_completed: bool,
    /// Replacement owner, if any.
    pub owner_id: Option<String>,
}
