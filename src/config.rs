//! Configuration for the sync core.
//!
//! [`SyncConfig`] can be built in code or loaded from TOML. Every field has
//! a default, so an empty file is a valid configuration.
//!
//! # Example Configuration File
//!
//! ```toml
//! channel = "tasks_changes"
//! collection = "tasks"
//! owner_filtered_feed = false
//! owner_stamp = "restamp"
//!
//! [list_retry]
//! max_attempts = 3
//! initial_backoff_ms = 200
//! max_backoff_ms = 2000
//!
//! [reconnect]
//! max_attempts = 5
//! initial_backoff_ms = 500
//! max_backoff_ms = 10000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

fn default_channel() -> String {
    "tasks_changes".to_string()
}

fn default_collection() -> String {
    crate::store::memory::DEFAULT_COLLECTION.to_string()
}

/// What a completion toggle does with the task's `owner_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerStampPolicy {
    /// Overwrite `owner_id` with the caller's current scoping key. A toggle
    /// issued under another scope moves the task into that scope.
    #[default]
    Restamp,
    /// Keep the task's existing `owner_id`.
    Preserve,
}

/// Bounded exponential backoff.
///
/// `max_attempts` counts the first try, so `1` means no retry.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskscope::config::RetryPolicy;
///
/// let policy = RetryPolicy::new(4, 100, 250);
/// assert_eq!(policy.backoff(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff(2), Duration::from_millis(200));
/// assert_eq!(policy.backoff(3), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// A policy with the given bounds. `max_attempts` is clamped to at
    /// least 1.
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, 0, 0)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Sync core configuration.
///
/// # Defaults
///
/// | Setting               | Default          | Description                                   |
/// |-----------------------|------------------|-----------------------------------------------|
/// | `channel`             | `tasks_changes`  | Change-feed channel name                      |
/// | `collection`          | `tasks`          | Tracked collection                            |
/// | `owner_filtered_feed` | `false`          | Ask the transport to filter events by owner   |
/// | `owner_stamp`         | `restamp`        | Owner handling on completion toggles          |
/// | `list_retry`          | 1 attempt        | Retry policy for idempotent list calls        |
/// | `reconnect`           | none             | Change-feed reconnect policy after a drop     |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Change-feed channel name.
    pub channel: String,

    /// Tracked collection name.
    pub collection: String,

    /// When `true`, subscriptions carry the scoping key as a server-side
    /// filter so other tenants' mutations do not trigger a resync.
    pub owner_filtered_feed: bool,

    /// Owner handling on completion toggles.
    pub owner_stamp: OwnerStampPolicy,

    /// Retry policy for list calls.
    pub list_retry: RetryPolicy,

    /// Reconnect policy after the transport drops the subscription. `None`
    /// leaves the view in its last known state until a manual refresh.
    pub reconnect: Option<RetryPolicy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            collection: default_collection(),
            owner_filtered_feed: false,
            owner_stamp: OwnerStampPolicy::default(),
            list_retry: RetryPolicy::none(),
            reconnect: None,
        }
    }
}

impl SyncConfig {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`](crate::SyncError::Config) if the file cannot
    /// be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`](crate::SyncError::Config) on invalid TOML or
    /// unknown enum values.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.list_retry.max_attempts = config.list_retry.max_attempts.max(1);
        if let Some(reconnect) = config.reconnect.as_mut() {
            reconnect.max_attempts = reconnect.max_attempts.max(1);
        }
        Ok(config)
    }

    /// Sets the change-feed channel name.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the tracked collection.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Enables or disables the server-side owner filter.
    pub fn with_owner_filtered_feed(mut self, filtered: bool) -> Self {
        self.owner_filtered_feed = filtered;
        self
    }

    /// Sets the owner stamping policy.
    pub fn with_owner_stamp(mut self, policy: OwnerStampPolicy) -> Self {
        self.owner_stamp = policy;
        self
    }

    /// Sets the list retry policy.
    pub fn with_list_retry(mut self, policy: RetryPolicy) -> Self {
        self.list_retry = policy;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(SyncConfig::from_toml("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn toml_overrides_fields() {
        let config = SyncConfig::from_toml(
            r#"
            channel = "org_tasks"
            owner_filtered_feed = true
            owner_stamp = "preserve"

            [list_retry]
            max_attempts = 3
            initial_backoff_ms = 10

            [reconnect]
            max_attempts = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.channel, "org_tasks");
        assert_eq!(config.collection, "tasks");
        assert!(config.owner_filtered_feed);
        assert_eq!(config.owner_stamp, OwnerStampPolicy::Preserve);
        assert_eq!(config.list_retry.max_attempts, 3);
        assert_eq!(config.list_retry.initial_backoff_ms, 10);
        assert_eq!(config.reconnect.unwrap().max_attempts, 1);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = SyncConfig::from_toml("owner_stamp = \"sometimes\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "collection = \"todos\"\n").unwrap();
        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.collection, "todos");

        let missing = SyncConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(SyncError::Config(_))));
    }

    #[test]
    fn builders_chain() {
        let config = SyncConfig::new()
            .with_channel("c")
            .with_collection("todos")
            .with_owner_filtered_feed(true)
            .with_owner_stamp(OwnerStampPolicy::Preserve)
            .with_list_retry(RetryPolicy::new(2, 5, 5))
            .with_reconnect(RetryPolicy::new(3, 1, 4));
        assert_eq!(config.channel, "c");
        assert_eq!(config.collection, "todos");
        assert_eq!(config.list_retry.max_attempts, 2);
        assert_eq!(config.reconnect.unwrap().backoff(3), Duration::from_millis(4));
    }

    #[test]
    fn backoff_is_capped_and_never_overflows() {
        let policy = RetryPolicy::new(100, u64::MAX / 2, 1_000);
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
        assert_eq!(RetryPolicy::none().backoff(1), Duration::ZERO);
        assert_eq!(RetryPolicy::new(0, 1, 1).max_attempts, 1);
    }
}
