//! Ownership-scoped task synchronization core.
//!
//! Keeps a local, observable list of tasks consistent with a shared remote
//! store while the user switches between a personal account and any number
//! of organizations. Every read and write is filtered or stamped with the
//! current **scoping key**; a live change feed triggers full resyncs; and a
//! generation counter discards responses that complete after the scope has
//! moved on.
//!
//! # Overview
//!
//! ```text
//! IdentityProvider ──► OwnershipContext ──(watch)──► SyncController ──► TaskView
//!        ▲                   ▲                         │      ▲
//!        │                   │                         ▼      │
//! OrganizationSwitchFlow ────┘              ScopedRepository  ChangeFeedSubscriber
//!                                                 │                 │
//!                                             TaskStore     ChangeFeedTransport
//! ```
//!
//! # Module Organization
//!
//! - [`ownership`] - Process-wide scope with a generation counter
//! - [`repository`] - Scoped CRUD over a [`TaskStore`](store::TaskStore)
//! - [`feed`] - Generation-bound change-feed subscriptions
//! - [`controller`] - The task list controller and its driver
//! - [`switch`] - Organization switching, creation and invitations
//! - [`store`] / [`identity`] - Collaborator seams and in-memory backends
//! - [`config`] - TOML-loadable configuration
//! - [`error`] - Error types
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use taskscope::{
//!     InMemoryIdentityProvider, InMemoryTaskStore, OrganizationSwitchFlow, OwnershipContext,
//!     SyncConfig, SyncController,
//! };
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let identity = Arc::new(InMemoryIdentityProvider::signed_in("U1"));
//! let store = Arc::new(InMemoryTaskStore::new());
//!
//! let ownership = OwnershipContext::new();
//! ownership.resolve(identity.as_ref()).await.unwrap();
//!
//! let tasks = SyncController::mount(
//!     &SyncConfig::default(),
//!     ownership.clone(),
//!     store.clone(),
//!     store.clone(),
//! );
//! let switcher = OrganizationSwitchFlow::new(identity.clone(), ownership.clone());
//!
//! tasks.create("Buy milk", None).await.unwrap();
//! switcher.create_organization("Acme").await.unwrap();
//! assert!(ownership.scope().unwrap().is_organization());
//!
//! tasks.shutdown().await;
//! # });
//! ```

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod feed;
pub mod identity;
#[cfg(feature = "logging")]
pub mod logging;
pub mod ownership;
pub mod repository;
pub mod store;
pub mod switch;
pub mod view;

// Re-exports for ergonomic access
pub use config::{OwnerStampPolicy, RetryPolicy, SyncConfig};
pub use controller::SyncController;
pub use domain::{Invitation, MemberRole, Membership, NewTask, Organization, Task, TaskPatch};
pub use error::{Operation, Result, SyncError};
pub use feed::{ChangeFeedSubscriber, FeedConfig, FeedSignal, Subscription};
pub use identity::{IdentityError, IdentityProvider, InMemoryIdentityProvider};
pub use ownership::{OwnershipContext, OwnershipKind, OwnershipScope, ScopeSnapshot};
pub use repository::{DeleteOutcome, Scoped, ScopedRepository};
pub use store::{ChangeFeedTransport, InMemoryTaskStore, StorageError, TaskStore};
pub use switch::{OrganizationSwitchFlow, SwitchView};
pub use view::{FeedStatus, FlowState, SyncPhase, TaskView};
