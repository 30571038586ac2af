//! Organization switching, creation and invitations.
//!
//! [`OrganizationSwitchFlow`] drives the identity provider and republishes
//! the ownership scope after every change of active organization, so a
//! mounted [`SyncController`](crate::controller::SyncController) follows
//! along. Input validation happens before any provider call.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use taskscope::identity::InMemoryIdentityProvider;
//! use taskscope::ownership::{OwnershipContext, OwnershipScope};
//! use taskscope::switch::OrganizationSwitchFlow;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let identity = Arc::new(InMemoryIdentityProvider::signed_in("U1"));
//! let ownership = OwnershipContext::new();
//! ownership.resolve(identity.as_ref()).await.unwrap();
//!
//! let flow = OrganizationSwitchFlow::new(identity.clone(), ownership.clone());
//! let org = flow.create_organization("  Acme  ").await.unwrap();
//! assert_eq!(org.name, "Acme");
//! assert_eq!(ownership.scope(), Some(OwnershipScope::organization(org.id.clone())));
//! assert_eq!(flow.snapshot().invite_prompt, Some(org));
//! # });
//! ```

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;

use crate::domain::{Invitation, MemberRole, Membership, Organization};
use crate::error::{Result, SyncError};
use crate::identity::IdentityProvider;
use crate::ownership::{OwnershipContext, OwnershipScope, ScopeSnapshot};
use crate::view::FlowState;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

/// Returns `true` if `email` looks like an email address.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL.is_match(email)
}

/// Everything the organization switcher UI renders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SwitchView {
    /// Switching the active organization.
    pub select: FlowState,
    /// Creating an organization.
    pub create: FlowState,
    /// Sending an invitation.
    pub invite: FlowState,
    /// Organization for which the optional "invite members" step is offered.
    pub invite_prompt: Option<Organization>,
}

#[derive(Debug, Clone, Copy)]
enum Flow {
    Select,
    Create,
    Invite,
}

impl Flow {
    fn name(self) -> &'static str {
        match self {
            Self::Select => "select_organization",
            Self::Create => "create_organization",
            Self::Invite => "invite_member",
        }
    }

    fn state(self, view: &mut SwitchView) -> &mut FlowState {
        match self {
            Self::Select => &mut view.select,
            Self::Create => &mut view.create,
            Self::Invite => &mut view.invite,
        }
    }
}

/// Organization switcher over an [`IdentityProvider`].
pub struct OrganizationSwitchFlow {
    identity: Arc<dyn IdentityProvider>,
    ownership: OwnershipContext,
    view: watch::Sender<SwitchView>,
}

impl std::fmt::Debug for OrganizationSwitchFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizationSwitchFlow")
            .field("ownership", &self.ownership)
            .field("view", &*self.view.borrow())
            .finish_non_exhaustive()
    }
}

impl OrganizationSwitchFlow {
    /// Creates a flow that publishes scope changes to `ownership`.
    pub fn new(identity: Arc<dyn IdentityProvider>, ownership: OwnershipContext) -> Self {
        let (view, _) = watch::channel(SwitchView::default());
        Self {
            identity,
            ownership,
            view,
        }
    }

    /// The current view.
    pub fn snapshot(&self) -> SwitchView {
        self.view.borrow().clone()
    }

    /// A receiver notified on every view change.
    pub fn watch(&self) -> watch::Receiver<SwitchView> {
        self.view.subscribe()
    }

    fn settle(&self, flow: Flow, state: FlowState) {
        self.view.send_modify(|view| *flow.state(view) = state);
    }

    fn fail(&self, flow: Flow, err: SyncError) -> SyncError {
        if err.is_validation() {
            tracing::debug!(flow = flow.name(), error = %err, "rejected input");
        } else {
            tracing::warn!(flow = flow.name(), error = %err, "organization operation failed");
        }
        self.settle(flow, FlowState::Failed(err.user_message()));
        err
    }

    /// The signed-in user's organization memberships.
    ///
    /// # Errors
    ///
    /// [`SyncError::Identity`] if the provider fails.
    pub async fn memberships(&self) -> Result<Vec<Membership>> {
        Ok(self.identity.memberships().await?)
    }

    /// The active organization, or `None` for the personal account.
    ///
    /// # Errors
    ///
    /// [`SyncError::Identity`] if the provider fails.
    pub async fn active_organization(&self) -> Result<Option<Organization>> {
        Ok(self.identity.active_organization().await?)
    }

    /// Activates `organization_id`, or the personal account for `None`, and
    /// publishes the resulting scope.
    ///
    /// # Errors
    ///
    /// [`SyncError::Identity`] if the provider rejects the switch. Nothing is
    /// published in that case.
    pub async fn select_organization(&self, organization_id: Option<&str>) -> Result<ScopeSnapshot> {
        self.settle(Flow::Select, FlowState::InFlight);
        let switched = async {
            self.identity
                .set_active_organization(organization_id)
                .await?;
            self.ownership.resolve(self.identity.as_ref()).await
        }
        .await;

        match switched {
            Ok(snapshot) => {
                tracing::debug!(organization = ?organization_id, "active organization switched");
                self.settle(Flow::Select, FlowState::Succeeded);
                Ok(snapshot)
            },
            Err(err) => Err(self.fail(Flow::Select, err)),
        }
    }

    /// Creates an organization named `name` (trimmed), makes it active and
    /// offers the invitation step for it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] for a blank name; the provider is not
    ///   called.
    /// - [`SyncError::Identity`] if the provider fails.
    pub async fn create_organization(&self, name: &str) -> Result<Organization> {
        let name = name.trim();
        if name.is_empty() {
            let err = SyncError::validation("name", "Organization name must not be empty");
            return Err(self.fail(Flow::Create, err));
        }

        self.settle(Flow::Create, FlowState::InFlight);
        let created = async {
            let organization = self.identity.create_organization(name).await?;
            self.identity
                .set_active_organization(Some(&organization.id))
                .await?;
            self.ownership.resolve(self.identity.as_ref()).await?;
            Ok::<_, SyncError>(organization)
        }
        .await;

        match created {
            Ok(organization) => {
                tracing::info!(organization = %organization.id, "organization created");
                let prompt = organization.clone();
                self.view.send_modify(|view| {
                    view.create = FlowState::Succeeded;
                    view.invite = FlowState::Idle;
                    view.invite_prompt = Some(prompt);
                });
                Ok(organization)
            },
            Err(err) => Err(self.fail(Flow::Create, err)),
        }
    }

    /// Closes the invitation step without sending anything.
    pub fn dismiss_invite_prompt(&self) {
        self.view.send_modify(|view| view.invite_prompt = None);
    }

    /// Invites `email` to the active organization as a member.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] if `email` is malformed or no
    ///   organization is active; the provider is not called.
    /// - [`SyncError::Identity`] if the provider rejects the invitation.
    pub async fn invite_member(&self, email: &str) -> Result<Invitation> {
        let email = email.trim();
        if !is_valid_email(email) {
            let err = SyncError::validation("email_address", "Please enter a valid email address");
            return Err(self.fail(Flow::Invite, err));
        }
        let Some(organization_id) = self
            .ownership
            .scope()
            .filter(OwnershipScope::is_organization)
            .map(|scope| scope.subject_id)
        else {
            let err = SyncError::validation("organization", "Select an organization first");
            return Err(self.fail(Flow::Invite, err));
        };

        self.settle(Flow::Invite, FlowState::InFlight);
        match self
            .identity
            .invite_member(&organization_id, email, MemberRole::Member)
            .await
        {
            Ok(invitation) => {
                tracing::info!(organization = %organization_id, "invitation sent");
                self.settle(Flow::Invite, FlowState::Succeeded);
                Ok(invitation)
            },
            Err(err) => Err(self.fail(Flow::Invite, err.into())),
        }
    }

    /// Signs out and clears the ownership scope.
    ///
    /// # Errors
    ///
    /// [`SyncError::Identity`] if the provider fails. The scope is left as
    /// it was in that case.
    pub async fn sign_out(&self) -> Result<()> {
        self.identity.sign_out().await.map_err(|err| {
            tracing::warn!(error = %err, "sign-out failed");
            SyncError::from(err)
        })?;
        self.ownership.publish(None);
        self.view.send_replace(SwitchView::default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryIdentityProvider;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    async fn setup(
        identity: InMemoryIdentityProvider,
    ) -> (Arc<InMemoryIdentityProvider>, OwnershipContext, OrganizationSwitchFlow) {
        let identity = Arc::new(identity);
        let ownership = OwnershipContext::new();
        ownership.resolve(identity.as_ref()).await.unwrap();
        let flow = OrganizationSwitchFlow::new(identity.clone(), ownership.clone());
        (identity, ownership, flow)
    }

    fn with_acme() -> InMemoryIdentityProvider {
        InMemoryIdentityProvider::signed_in("U1")
            .with_organization(Organization::new("O1", "Acme"), MemberRole::Admin)
    }

    #[rstest]
    #[case("a@b.co", true)]
    #[case("first.last@example.org", true)]
    #[case("not-an-email", false)]
    #[case("missing@tld", false)]
    #[case("two@@at.com", false)]
    #[case("spa ce@x.io", false)]
    #[case("", false)]
    fn email_pattern(#[case] email: &str, #[case] valid: bool) {
        assert_eq!(is_valid_email(email), valid);
    }

    #[tokio::test]
    async fn select_publishes_organization_then_personal() {
        let (_identity, ownership, flow) = setup(with_acme()).await;
        assert_eq!(ownership.scoping_key().unwrap(), "U1");

        flow.select_organization(Some("O1")).await.unwrap();
        assert_eq!(ownership.scope(), Some(OwnershipScope::organization("O1")));
        assert_eq!(flow.snapshot().select, FlowState::Succeeded);

        flow.select_organization(None).await.unwrap();
        assert_eq!(ownership.scope(), Some(OwnershipScope::personal("U1")));
    }

    #[tokio::test]
    async fn rejected_select_publishes_nothing() {
        let (_identity, ownership, flow) = setup(with_acme()).await;
        let before = ownership.generation();

        let err = flow.select_organization(Some("O9")).await.unwrap_err();
        assert!(matches!(err, SyncError::Identity(_)));
        assert_eq!(ownership.generation(), before);
        assert!(flow.snapshot().select.error().is_some());
    }

    #[tokio::test]
    async fn blank_organization_name_never_reaches_provider() {
        let (identity, ownership, flow) = setup(with_acme()).await;
        let before = ownership.generation();

        let err = flow.create_organization("   ").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(identity.calls("create_organization"), 0);
        assert_eq!(ownership.generation(), before);
        assert_eq!(
            flow.snapshot().create,
            FlowState::Failed("Organization name must not be empty".to_string())
        );
    }

    #[tokio::test]
    async fn create_organization_activates_and_offers_invite() {
        let (identity, ownership, flow) = setup(with_acme()).await;
        let org = flow.create_organization(" Beta ").await.unwrap();

        assert_eq!(org.name, "Beta");
        assert_eq!(identity.active_organization().await.unwrap(), Some(org.clone()));
        assert_eq!(ownership.scoping_key().unwrap(), org.id);
        assert_eq!(flow.snapshot().invite_prompt, Some(org));
        assert_eq!(flow.memberships().await.unwrap().len(), 2);

        flow.dismiss_invite_prompt();
        assert_eq!(flow.snapshot().invite_prompt, None);
    }

    #[tokio::test]
    async fn create_failure_is_reported() {
        let (identity, _ownership, flow) = setup(with_acme()).await;
        identity.fail("create_organization");
        let err = flow.create_organization("Beta").await.unwrap_err();
        assert!(matches!(err, SyncError::Identity(_)));
        assert_eq!(flow.snapshot().invite_prompt, None);
        assert!(flow.snapshot().create.error().is_some());
    }

    #[tokio::test]
    async fn malformed_email_never_reaches_provider() {
        let (identity, _ownership, flow) = setup(with_acme()).await;
        flow.select_organization(Some("O1")).await.unwrap();

        let err = flow.invite_member("not-an-email").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(identity.calls("invite_member"), 0);
    }

    #[tokio::test]
    async fn invite_requires_active_organization() {
        let (identity, _ownership, flow) = setup(with_acme()).await;
        let err = flow.invite_member("a@b.co").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation {
                field: "organization",
                ..
            }
        ));
        assert_eq!(identity.calls("invite_member"), 0);
    }

    #[tokio::test]
    async fn invite_sends_member_role_with_trimmed_email() {
        let (identity, _ownership, flow) = setup(with_acme()).await;
        flow.select_organization(Some("O1")).await.unwrap();

        let invitation = flow.invite_member("  a@b.co ").await.unwrap();
        assert_eq!(invitation.email_address, "a@b.co");
        assert_eq!(invitation.role, MemberRole::Member);
        assert_eq!(identity.invitations(), vec![invitation]);

        let duplicate = flow.invite_member("a@b.co").await.unwrap_err();
        assert!(matches!(duplicate, SyncError::Identity(_)));
        assert!(flow.snapshot().invite.error().is_some());
    }

    #[tokio::test]
    async fn sign_out_clears_scope() {
        let (identity, ownership, flow) = setup(with_acme()).await;
        flow.create_organization("Beta").await.unwrap();

        flow.sign_out().await.unwrap();
        assert!(ownership.scope().is_none());
        assert_eq!(flow.snapshot(), SwitchView::default());
        assert!(identity.session_token().await.unwrap().is_none());
    }
}
