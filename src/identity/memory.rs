//! In-memory identity provider for development and testing.
//!
//! [`InMemoryIdentityProvider`] keeps the signed-in user, memberships, the
//! active organization and sent invitations in memory, counts every call,
//! and can be told to fail specific operations. **Never use in production.**
//!
//! # Example
//!
//! ```rust
//! use taskscope::domain::{MemberRole, Organization};
//! use taskscope::identity::{IdentityProvider, InMemoryIdentityProvider};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let identity = InMemoryIdentityProvider::signed_in("U1")
//!     .with_organization(Organization::new("O1", "Acme"), MemberRole::Admin)
//!     .with_active_organization("O1");
//!
//! let active = identity.active_organization().await.unwrap().unwrap();
//! assert_eq!(active.id, "O1");
//! assert_eq!(identity.calls("active_organization"), 1);
//! # });
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::{Invitation, MemberRole, Membership, Organization};

use super::{IdentityError, IdentityProvider};

#[derive(Debug, Default)]
struct IdentityState {
    user_id: Option<String>,
    token: Option<String>,
    memberships: Vec<Membership>,
    active: Option<String>,
    invitations: Vec<Invitation>,
}

/// In-memory [`IdentityProvider`].
#[derive(Debug, Default)]
pub struct InMemoryIdentityProvider {
    state: Mutex<IdentityState>,
    calls: DashMap<&'static str, usize>,
    failing: Mutex<HashSet<&'static str>>,
}

impl InMemoryIdentityProvider {
    /// A provider with no signed-in user.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider with `user_id` signed in and the personal account active.
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let provider = Self::new();
        provider.sign_in(user_id);
        provider
    }

    /// Adds a membership.
    pub fn with_organization(self, organization: Organization, role: MemberRole) -> Self {
        self.state.lock().memberships.push(Membership { organization, role });
        self
    }

    /// Marks an existing membership as the active organization.
    pub fn with_active_organization(self, organization_id: impl Into<String>) -> Self {
        self.state.lock().active = Some(organization_id.into());
        self
    }

    /// Signs `user_id` in, issuing a fresh session token.
    pub fn sign_in(&self, user_id: impl Into<String>) {
        let mut state = self.state.lock();
        state.user_id = Some(user_id.into());
        state.token = Some(format!("sess_{}", Uuid::new_v4().simple()));
    }

    /// Makes `operation` (a trait method name) fail with
    /// [`IdentityError::Backend`] until [`recover`](Self::recover).
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    /// Clears all injected failures.
    pub fn recover(&self) {
        self.failing.lock().clear();
    }

    /// How many times `operation` was called.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map_or(0, |count| *count)
    }

    /// Invitations sent so far.
    pub fn invitations(&self) -> Vec<Invitation> {
        self.state.lock().invitations.clone()
    }

    fn enter(&self, operation: &'static str) -> Result<(), IdentityError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if self.failing.lock().contains(operation) {
            return Err(IdentityError::Backend {
                message: format!("{operation} is unavailable"),
            });
        }
        Ok(())
    }

    fn require_user(state: &IdentityState) -> Result<&str, IdentityError> {
        state
            .user_id
            .as_deref()
            .ok_or(IdentityError::Unauthenticated)
    }

    fn find(state: &IdentityState, organization_id: &str) -> Option<Organization> {
        state
            .memberships
            .iter()
            .find(|m| m.organization.id == organization_id)
            .map(|m| m.organization.clone())
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn session_token(&self) -> Result<Option<String>, IdentityError> {
        self.enter("session_token")?;
        Ok(self.state.lock().token.clone())
    }

    async fn current_user_id(&self) -> Result<Option<String>, IdentityError> {
        self.enter("current_user_id")?;
        Ok(self.state.lock().user_id.clone())
    }

    async fn active_organization(&self) -> Result<Option<Organization>, IdentityError> {
        self.enter("active_organization")?;
        let state = self.state.lock();
        Ok(state
            .active
            .as_deref()
            .and_then(|id| Self::find(&state, id)))
    }

    async fn memberships(&self) -> Result<Vec<Membership>, IdentityError> {
        self.enter("memberships")?;
        let state = self.state.lock();
        Self::require_user(&state)?;
        Ok(state.memberships.clone())
    }

    async fn set_active_organization(
        &self,
        organization_id: Option<&str>,
    ) -> Result<Option<Organization>, IdentityError> {
        self.enter("set_active_organization")?;
        let mut state = self.state.lock();
        Self::require_user(&state)?;
        let Some(id) = organization_id else {
            state.active = None;
            return Ok(None);
        };
        let organization = Self::find(&state, id).ok_or_else(|| IdentityError::Rejected {
            message: format!("not a member of organization {id}"),
        })?;
        state.active = Some(organization.id.clone());
        Ok(Some(organization))
    }

    async fn create_organization(&self, name: &str) -> Result<Organization, IdentityError> {
        self.enter("create_organization")?;
        let mut state = self.state.lock();
        Self::require_user(&state)?;
        let organization = Organization::new(format!("org_{}", Uuid::new_v4().simple()), name);
        state.memberships.push(Membership {
            organization: organization.clone(),
            role: MemberRole::Admin,
        });
        Ok(organization)
    }

    async fn invite_member(
        &self,
        organization_id: &str,
        email_address: &str,
        role: MemberRole,
    ) -> Result<Invitation, IdentityError> {
        self.enter("invite_member")?;
        let mut state = self.state.lock();
        Self::require_user(&state)?;
        if Self::find(&state, organization_id).is_none() {
            return Err(IdentityError::Rejected {
                message: format!("not a member of organization {organization_id}"),
            });
        }
        if state
            .invitations
            .iter()
            .any(|i| i.organization_id == organization_id && i.email_address == email_address)
        {
            return Err(IdentityError::Rejected {
                message: format!("{email_address} has already been invited"),
            });
        }
        let invitation = Invitation {
            organization_id: organization_id.to_string(),
            email_address: email_address.to_string(),
            role,
        };
        state.invitations.push(invitation.clone());
        Ok(invitation)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.enter("sign_out")?;
        let mut state = self.state.lock();
        state.user_id = None;
        state.token = None;
        state.active = None;
        Ok(())
    }
}
