//! Error types for scoped task synchronization.
//!
//! [`SyncError`] is the error surfaced to callers of the sync core. Lower
//! layers have their own error enums ([`StorageError`] for the remote store,
//! [`IdentityError`] for the identity provider) which are wrapped with the
//! operation that failed.

use thiserror::Error;

pub use crate::identity::IdentityError;
pub use crate::store::StorageError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Repository operation names carried by [`SyncError::Repository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Scoped listing of tasks.
    List,
    /// Single scoped read.
    Get,
    /// Task insertion.
    Create,
    /// Completion toggle.
    SetCompletion,
    /// Scoped deletion.
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::List => "list",
            Self::Get => "get",
            Self::Create => "create",
            Self::SetCompletion => "set_completion",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the sync core.
///
/// Validation errors are produced locally and never reach a collaborator.
/// Every other variant wraps a failure reported by the store or the identity
/// provider. None of them are fatal; callers surface them as transient
/// messages.
///
/// # Examples
///
/// ```
/// use taskscope::SyncError;
///
/// let err = SyncError::validation("title", "must not be blank");
/// assert!(err.is_validation());
/// assert_eq!(err.to_string(), "invalid title: must not be blank");
/// ```
#[derive(Debug, Error)]
pub enum SyncError {
    /// Input rejected before any network call.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// The offending input field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A remote store operation failed.
    #[error("{operation} failed")]
    Repository {
        /// The repository operation that failed.
        operation: Operation,
        /// The underlying store failure.
        #[source]
        source: StorageError,
    },

    /// The mutation or read target does not exist.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The missing task ID.
        task_id: String,
    },

    /// A scoped operation was attempted before identity resolution completed.
    #[error("ownership context is not resolved; sign in first")]
    AuthContext,

    /// The identity provider rejected or failed a request.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Builds a [`SyncError::Validation`].
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn repository(operation: Operation, source: StorageError) -> Self {
        Self::Repository { operation, source }
    }

    /// Returns `true` for errors caught before any collaborator was called.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// A short message suitable for a transient UI notice.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskscope::SyncError;
    ///
    /// assert_eq!(
    ///     SyncError::AuthContext.user_message(),
    ///     "Please sign in to continue."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { reason, .. } => reason.clone(),
            Self::Repository { operation, .. } => {
                format!("Could not {} tasks. Please try again.", operation.verb())
            },
            Self::NotFound { .. } => "That task no longer exists.".to_string(),
            Self::AuthContext => "Please sign in to continue.".to_string(),
            Self::Identity(_) => "The account service did not accept the request.".to_string(),
            Self::Config(msg) => msg.clone(),
        }
    }
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Self::List | Self::Get => "load",
            Self::Create => "add",
            Self::SetCompletion => "update",
            Self::Delete => "delete",
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn validation_display() {
        let err = SyncError::validation("email", "not an email address");
        assert_eq!(err.to_string(), "invalid email: not an email address");
        assert!(err.is_validation());
        assert_eq!(err.user_message(), "not an email address");
    }

    #[test]
    fn repository_error_keeps_source() {
        let err = SyncError::repository(
            Operation::Delete,
            StorageError::Unavailable {
                message: "connection reset".to_string(),
            },
        );
        assert_eq!(err.to_string(), "delete failed");
        let source = err.source().expect("storage error is the source");
        assert!(source.to_string().contains("connection reset"));
        assert!(source.source().is_none());
        assert!(!err.is_validation());
        assert_eq!(err.user_message(), "Could not delete tasks. Please try again.");
    }

    #[test]
    fn not_found_display() {
        let err = SyncError::NotFound {
            task_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "task not found: abc");
    }

    #[test]
    fn identity_error_is_transparent() {
        let err: SyncError = IdentityError::Unauthenticated.into();
        assert_eq!(err.to_string(), IdentityError::Unauthenticated.to_string());
    }

    #[test]
    fn operation_names() {
        assert_eq!(Operation::List.to_string(), "list");
        assert_eq!(Operation::SetCompletion.to_string(), "set_completion");
    }
}
