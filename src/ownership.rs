//! Ownership context: which personal account or organization owns records
//! right now.
//!
//! [`OwnershipContext`] is process-wide state shared by cheap clones. It
//! publishes [`ScopeSnapshot`]s over a `tokio::sync::watch` channel; each
//! published change bumps a **generation** counter. Async operations record
//! the generation they were issued under and compare it with the current one
//! on completion (stale-response guard) instead of trusting a captured key.
//!
//! # Resolution
//!
//! The scoping key is the active organization's ID if one is active, else the
//! signed-in user's ID. Before identity resolution there is no key, and every
//! scoped operation fails with [`SyncError::AuthContext`].
//!
//! # Examples
//!
//! ```
//! use taskscope::ownership::{OwnershipContext, OwnershipScope};
//!
//! let ctx = OwnershipContext::new();
//! assert!(ctx.scoping_key().is_err());
//!
//! let first = ctx.publish(Some(OwnershipScope::personal("U1")));
//! assert_eq!(ctx.scoping_key().unwrap(), "U1");
//!
//! let second = ctx.publish(Some(OwnershipScope::organization("O1")));
//! assert!(second.generation > first.generation);
//! assert!(!ctx.is_current(first.generation));
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Result, SyncError};
use crate::identity::IdentityProvider;

/// Whether records are owned by a person or an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnershipKind {
    /// The signed-in user's personal account.
    Personal,
    /// The active organization.
    Organization,
}

/// A resolved ownership selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnershipScope {
    /// Personal or organization.
    pub kind: OwnershipKind,
    /// User or organization ID, used verbatim as `owner_id`.
    pub subject_id: String,
}

impl OwnershipScope {
    /// A personal scope for `user_id`.
    pub fn personal(user_id: impl Into<String>) -> Self {
        Self {
            kind: OwnershipKind::Personal,
            subject_id: user_id.into(),
        }
    }

    /// An organization scope for `organization_id`.
    pub fn organization(organization_id: impl Into<String>) -> Self {
        Self {
            kind: OwnershipKind::Organization,
            subject_id: organization_id.into(),
        }
    }

    /// The scoping key.
    pub fn key(&self) -> &str {
        &self.subject_id
    }

    /// Returns `true` for organization scopes.
    pub fn is_organization(&self) -> bool {
        self.kind == OwnershipKind::Organization
    }
}

impl fmt::Display for OwnershipScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OwnershipKind::Personal => write!(f, "personal:{}", self.subject_id),
            OwnershipKind::Organization => write!(f, "organization:{}", self.subject_id),
        }
    }
}

/// The published state: current scope (if resolved) and its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSnapshot {
    /// `None` before identity resolution and after sign-out.
    pub scope: Option<OwnershipScope>,
    /// Bumped on every published change, starting at 0.
    pub generation: u64,
}

impl ScopeSnapshot {
    /// The scoping key, if resolved.
    pub fn key(&self) -> Option<&str> {
        self.scope.as_ref().map(OwnershipScope::key)
    }
}

/// Process-wide ownership state with a generation counter.
///
/// Clones share the same state. Publishing is a single atomic replace of the
/// snapshot; observers never see an intermediate state.
#[derive(Debug, Clone)]
pub struct OwnershipContext {
    tx: Arc<watch::Sender<ScopeSnapshot>>,
}

impl OwnershipContext {
    /// An unresolved context at generation 0.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ScopeSnapshot {
            scope: None,
            generation: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// A context already resolved to `scope`, at generation 1.
    pub fn resolved(scope: OwnershipScope) -> Self {
        let ctx = Self::new();
        ctx.publish(Some(scope));
        ctx
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> ScopeSnapshot {
        self.tx.borrow().clone()
    }

    /// The current scope, if resolved.
    pub fn scope(&self) -> Option<OwnershipScope> {
        self.tx.borrow().scope.clone()
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    /// Returns `true` if no scope change was published since `generation`.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// The current scoping key together with its generation, read in one
    /// step.
    ///
    /// # Errors
    ///
    /// [`SyncError::AuthContext`] before identity resolution.
    pub fn current_key(&self) -> Result<(String, u64)> {
        let snapshot = self.tx.borrow();
        let current = snapshot
            .key()
            .map(|key| (key.to_string(), snapshot.generation))
            .ok_or(SyncError::AuthContext);
        current
    }

    /// The current scoping key.
    ///
    /// # Errors
    ///
    /// [`SyncError::AuthContext`] before identity resolution.
    pub fn scoping_key(&self) -> Result<String> {
        self.current_key().map(|(key, _)| key)
    }

    /// Publishes a new scope and bumps the generation.
    ///
    /// Publishing the scope that is already current changes nothing and
    /// returns the existing snapshot.
    pub fn publish(&self, scope: Option<OwnershipScope>) -> ScopeSnapshot {
        let mut published = None;
        self.tx.send_if_modified(|snapshot| {
            if snapshot.scope == scope {
                return false;
            }
            snapshot.scope = scope;
            snapshot.generation += 1;
            published = Some(snapshot.clone());
            true
        });
        match published {
            Some(snapshot) => {
                tracing::info!(
                    generation = snapshot.generation,
                    scope = ?snapshot.scope.as_ref().map(ToString::to_string),
                    "ownership scope changed"
                );
                snapshot
            },
            None => self.snapshot(),
        }
    }

    /// Subscribes to scope changes. The receiver starts with the current
    /// snapshot marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<ScopeSnapshot> {
        self.tx.subscribe()
    }

    /// Resolves the scope from the identity provider and publishes it.
    ///
    /// No session token means unauthenticated, which publishes `None`. With
    /// a session, the active organization wins over the personal account.
    ///
    /// # Errors
    ///
    /// [`SyncError::Identity`] if the provider fails; nothing is published
    /// in that case.
    pub async fn resolve(&self, identity: &dyn IdentityProvider) -> Result<ScopeSnapshot> {
        if identity.session_token().await?.is_none() {
            return Ok(self.publish(None));
        }
        let scope = match identity.active_organization().await? {
            Some(organization) => Some(OwnershipScope::organization(organization.id)),
            None => identity
                .current_user_id()
                .await?
                .map(OwnershipScope::personal),
        };
        Ok(self.publish(scope))
    }
}

impl Default for OwnershipContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MemberRole, Organization};
    use crate::identity::InMemoryIdentityProvider;

    #[test]
    fn new_context_is_unresolved() {
        let ctx = OwnershipContext::new();
        assert_eq!(ctx.generation(), 0);
        assert!(ctx.scope().is_none());
        assert!(matches!(ctx.scoping_key(), Err(SyncError::AuthContext)));
    }

    #[test]
    fn publish_bumps_generation_once_per_change() {
        let ctx = OwnershipContext::new();
        let a = ctx.publish(Some(OwnershipScope::personal("U1")));
        assert_eq!(a.generation, 1);

        let same = ctx.publish(Some(OwnershipScope::personal("U1")));
        assert_eq!(same.generation, 1);

        let b = ctx.publish(Some(OwnershipScope::organization("O1")));
        assert_eq!(b.generation, 2);
        assert_eq!(ctx.current_key().unwrap(), ("O1".to_string(), 2));

        let cleared = ctx.publish(None);
        assert_eq!(cleared.generation, 3);
        assert!(ctx.scoping_key().is_err());
    }

    #[test]
    fn clones_share_state() {
        let ctx = OwnershipContext::new();
        let other = ctx.clone();
        other.publish(Some(OwnershipScope::organization("O1")));
        assert_eq!(ctx.scoping_key().unwrap(), "O1");
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let ctx = OwnershipContext::resolved(OwnershipScope::personal("U1"));
        let mut rx = ctx.subscribe();
        assert!(!rx.has_changed().unwrap());

        ctx.publish(Some(OwnershipScope::organization("O1")));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().key(), Some("O1"));
    }

    #[test]
    fn scope_display() {
        assert_eq!(OwnershipScope::personal("U1").to_string(), "personal:U1");
        assert_eq!(
            OwnershipScope::organization("O1").to_string(),
            "organization:O1"
        );
        assert!(OwnershipScope::organization("O1").is_organization());
    }

    #[tokio::test]
    async fn resolve_prefers_active_organization() {
        let identity = InMemoryIdentityProvider::signed_in("U1")
            .with_organization(Organization::new("O1", "Acme"), MemberRole::Admin)
            .with_active_organization("O1");
        let ctx = OwnershipContext::new();
        let snapshot = ctx.resolve(&identity).await.unwrap();
        assert_eq!(snapshot.scope, Some(OwnershipScope::organization("O1")));
    }

    #[tokio::test]
    async fn resolve_falls_back_to_personal() {
        let identity = InMemoryIdentityProvider::signed_in("U1");
        let ctx = OwnershipContext::new();
        let snapshot = ctx.resolve(&identity).await.unwrap();
        assert_eq!(snapshot.scope, Some(OwnershipScope::personal("U1")));
    }

    #[tokio::test]
    async fn resolve_without_session_stays_unresolved() {
        let identity = InMemoryIdentityProvider::new();
        let ctx = OwnershipContext::new();
        let snapshot = ctx.resolve(&identity).await.unwrap();
        assert!(snapshot.scope.is_none());
        assert_eq!(snapshot.generation, 0);
    }

    #[tokio::test]
    async fn resolve_failure_publishes_nothing() {
        let identity = InMemoryIdentityProvider::signed_in("U1");
        identity.fail("active_organization");
        let ctx = OwnershipContext::new();
        assert!(matches!(
            ctx.resolve(&identity).await,
            Err(SyncError::Identity(_))
        ));
        assert_eq!(ctx.generation(), 0);
    }
}
