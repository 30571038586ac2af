//! Identity provider seam.
//!
//! The identity provider issues session tokens, knows who the signed-in user
//! is, and manages organizations, memberships and invitations. The sync core
//! never talks to it directly except through [`IdentityProvider`]; the
//! ownership context and the organization switch flow are its only callers.
//!
//! # Example
//!
//! ```rust
//! use taskscope::identity::{IdentityProvider, InMemoryIdentityProvider};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let identity = InMemoryIdentityProvider::signed_in("U1");
//! assert_eq!(identity.current_user_id().await.unwrap().as_deref(), Some("U1"));
//! assert!(identity.active_organization().await.unwrap().is_none());
//! # });
//! ```

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Invitation, MemberRole, Membership, Organization};

pub use memory::InMemoryIdentityProvider;

/// Errors reported by the identity provider.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No signed-in session.
    #[error("not signed in")]
    Unauthenticated,

    /// The provider refused the request (unknown organization, duplicate
    /// invitation, insufficient role, ...).
    #[error("identity provider rejected the request: {message}")]
    Rejected {
        /// Human-readable description.
        message: String,
    },

    /// Transport or provider-side failure.
    #[error("identity provider error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
    },
}

/// Operations the sync core consumes from the identity provider.
///
/// Implementations must be `Send + Sync`; a single provider is shared by the
/// ownership context and the switch flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The current session token, `None` before authentication.
    async fn session_token(&self) -> Result<Option<String>, IdentityError>;

    /// ID of the signed-in user, `None` before authentication.
    async fn current_user_id(&self) -> Result<Option<String>, IdentityError>;

    /// The active organization, `None` when the personal account is active.
    async fn active_organization(&self) -> Result<Option<Organization>, IdentityError>;

    /// Organizations the user belongs to.
    async fn memberships(&self) -> Result<Vec<Membership>, IdentityError>;

    /// Activates an organization, or the personal account for `None`.
    async fn set_active_organization(
        &self,
        organization_id: Option<&str>,
    ) -> Result<Option<Organization>, IdentityError>;

    /// Creates an organization owned by the signed-in user. Does not
    /// activate it.
    async fn create_organization(&self, name: &str) -> Result<Organization, IdentityError>;

    /// Sends an invitation to join `organization_id`.
    async fn invite_member(
        &self,
        organization_id: &str,
        email_address: &str,
        role: MemberRole,
    ) -> Result<Invitation, IdentityError>;

    /// Ends the session.
    async fn sign_out(&self) -> Result<(), IdentityError>;
}
