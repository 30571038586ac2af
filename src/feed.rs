//! Change-feed subscriptions bound to a scope generation.
//!
//! [`ChangeFeedSubscriber`] opens a transport subscription and spawns a
//! forwarding task that turns every [`ChangeEvent`](crate::store::ChangeEvent)
//! into a [`FeedSignal::Changed`] on the caller's channel. Each signal carries
//! the generation the subscription was opened under, so the receiver can drop
//! signals from subscriptions that belong to a superseded scope.
//!
//! # Lifecycle
//!
//! [`Subscription::close`] consumes the handle, so a subscription is closed
//! at most once. Dropping an unclosed handle aborts the forwarder
//! immediately and releases the transport subscription in the background.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use taskscope::feed::{ChangeFeedSubscriber, FeedConfig, FeedSignal};
//! use taskscope::store::InMemoryTaskStore;
//! use tokio::sync::mpsc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let subscriber = ChangeFeedSubscriber::new(store.clone(), FeedConfig::default());
//!
//! let (tx, _rx) = mpsc::unbounded_channel::<FeedSignal>();
//! let subscription = subscriber.subscribe(1, "U1", tx).await.unwrap();
//! assert_eq!(store.active_subscriptions(), 1);
//!
//! assert!(subscription.close().await.unwrap());
//! assert_eq!(store.active_subscriptions(), 0);
//! # });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::store::{ChangeFeedTransport, ChannelSpec, StorageError, SubscriptionId};

/// A notification delivered to the subscriber's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSignal {
    /// Something in the tracked collection changed.
    Changed {
        /// Generation the subscription was opened under.
        generation: u64,
    },
    /// The transport dropped the subscription. Sent once, after which the
    /// subscription delivers nothing.
    Disconnected {
        /// Generation the subscription was opened under.
        generation: u64,
    },
}

impl FeedSignal {
    /// Generation the originating subscription was opened under.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Changed { generation } | Self::Disconnected { generation } => *generation,
        }
    }
}

/// What a [`ChangeFeedSubscriber`] subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// Logical channel name.
    pub channel: String,
    /// Tracked collection.
    pub collection: String,
    /// Request a server-side owner filter.
    pub owner_filtered: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for FeedConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            collection: config.collection.clone(),
            owner_filtered: config.owner_filtered_feed,
        }
    }
}

/// Opens generation-bound subscriptions on a [`ChangeFeedTransport`].
#[derive(Clone)]
pub struct ChangeFeedSubscriber {
    transport: Arc<dyn ChangeFeedTransport>,
    config: FeedConfig,
}

impl std::fmt::Debug for ChangeFeedSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedSubscriber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChangeFeedSubscriber {
    /// Creates a subscriber for `transport`.
    pub fn new(transport: Arc<dyn ChangeFeedTransport>, config: FeedConfig) -> Self {
        Self { transport, config }
    }

    /// The subscription settings.
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Opens a subscription and starts forwarding its events to `sink`.
    ///
    /// `owner_filter_key` is passed to the transport only when the
    /// configuration asks for owner filtering.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the subscription cannot be opened.
    /// Nothing is spawned in that case.
    pub async fn subscribe(
        &self,
        generation: u64,
        owner_filter_key: &str,
        sink: mpsc::UnboundedSender<FeedSignal>,
    ) -> Result<Subscription, StorageError> {
        let spec = ChannelSpec {
            channel: self.config.channel.clone(),
            collection: self.config.collection.clone(),
            owner_filter: self
                .config
                .owner_filtered
                .then(|| owner_filter_key.to_string()),
        };
        let opened = self.transport.subscribe(spec).await?;
        let id = opened.id;
        tracing::info!(subscription = %id, generation, "change feed subscribed");

        let collection = self.config.collection.clone();
        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disconnected);
        let mut events = opened.events;
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.collection != collection => {},
                    Ok(_) => {
                        if sink.send(FeedSignal::Changed { generation }).is_err() {
                            break;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(subscription = %id, skipped, "change feed lagged");
                        if sink.send(FeedSignal::Changed { generation }).is_err() {
                            break;
                        }
                    },
                    Err(RecvError::Closed) => {
                        tracing::warn!(subscription = %id, generation, "change feed disconnected");
                        flag.store(true, Ordering::SeqCst);
                        let _ = sink.send(FeedSignal::Disconnected { generation });
                        break;
                    },
                }
            }
        });

        Ok(Subscription {
            id,
            generation,
            transport: Arc::clone(&self.transport),
            forwarder: Some(forwarder),
            disconnected,
        })
    }
}

/// Handle to an open subscription.
#[must_use = "dropping a subscription closes it"]
pub struct Subscription {
    id: SubscriptionId,
    generation: u64,
    transport: Arc<dyn ChangeFeedTransport>,
    forwarder: Option<JoinHandle<()>>,
    disconnected: Arc<AtomicBool>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// The transport subscription ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Generation the subscription is bound to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` once the transport has dropped the subscription. Set
    /// before [`FeedSignal::Disconnected`] is sent.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Stops forwarding and unsubscribes from the transport.
    ///
    /// Returns `false` if the transport no longer knew the subscription,
    /// which is the case after a connection drop.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if unsubscribing fails. Forwarding has
    /// stopped regardless.
    ///
    /// If the returned future is dropped before `unsubscribe` resolves, the
    /// handle's `Drop` releases the transport subscription instead.
    pub async fn close(mut self) -> Result<bool, StorageError> {
        if let Some(forwarder) = &self.forwarder {
            forwarder.abort();
        }
        let result = self.transport.unsubscribe(self.id).await;
        // Unsubscribe was attempted; nothing left for Drop to release.
        self.forwarder = None;
        let closed = result?;
        tracing::info!(subscription = %self.id, generation = self.generation, "change feed closed");
        Ok(closed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(forwarder) = self.forwarder.take() else {
            return;
        };
        forwarder.abort();
        tracing::warn!(subscription = %self.id, "subscription dropped without close");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            let id = self.id;
            handle.spawn(async move {
                let _ = transport.unsubscribe(id).await;
            });
        }
    }
}
