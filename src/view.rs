//! Observable state exposed to the UI layer.
//!
//! Each user-facing flow has exactly one [`FlowState`] instead of a set of
//! independent `loading` / `creating` / `sending` flags, so impossible
//! combinations cannot be represented.

use serde::Serialize;

use crate::domain::Task;
use crate::ownership::OwnershipScope;

/// State of one user-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum FlowState {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// A request is outstanding.
    InFlight,
    /// The last request succeeded.
    Succeeded,
    /// The last request failed, with a user-facing message.
    Failed(String),
}

impl FlowState {
    /// Returns `true` while a request is outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight)
    }

    /// The failure message, if the last request failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// Lifecycle of the synchronized list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No scope resolved yet (before sign-in, or after sign-out).
    #[default]
    Uninitialized,
    /// Listing the tasks of a newly published scope.
    Loading,
    /// The list reflects the last successful read of the current scope.
    Ready,
    /// The last read failed; the previous list stays visible.
    Error,
}

/// Health of the live change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    /// No subscription is open.
    #[default]
    Idle,
    /// A subscription is open for the current scope.
    Live,
    /// The subscription was lost or could not be opened; no live updates
    /// until a refresh or reconnect.
    Disconnected,
}

/// Everything the task list UI renders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TaskView {
    /// List lifecycle.
    pub phase: SyncPhase,
    /// Tasks of the current scope, newest first.
    pub tasks: Vec<Task>,
    /// The scope the view is bound to.
    #[serde(skip)]
    pub scope: Option<OwnershipScope>,
    /// Generation of [`scope`](Self::scope).
    pub generation: u64,
    /// User-facing message of the last failed read.
    pub list_error: Option<String>,
    /// Change-feed health.
    pub feed: FeedStatus,
    /// Task creation flow.
    pub create: FlowState,
    /// Completion toggle flow.
    pub toggle: FlowState,
    /// Deletion flow.
    pub delete: FlowState,
}

impl TaskView {
    /// Returns `true` while the list of a new scope is loading.
    pub fn loading(&self) -> bool {
        self.phase == SyncPhase::Loading
    }

    /// Looks a task up by ID.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Titles in display order.
    pub fn titles(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.title.as_str()).collect()
    }
}
