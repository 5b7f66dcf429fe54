//! Publish/subscribe backplane for room channels.
//!
//! A [`Broker`] keys channels by name and preserves publish order per channel
//! within one broker instance. Relay processes that share a broker observe
//! the same order for every room. That guarantee only holds when each channel
//! has a single ordering-authoritative endpoint: one [`BrokerServer`] for all
//! processes, or a single process using [`MemoryBroker`].
//!
//! Publish order matches message id order within one relay process, where a
//! room's pipelines publish under a shared lock. Relays persisting the same
//! room at once are not ordered against each other, so strict id order
//! across processes needs a room's senders on one relay.

mod memory;
mod tcp;

pub use memory::MemoryBroker;
pub use tcp::{BrokerServer, BrokerServerStats, TcpBroker};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::{BrokerConfig, BrokerKind};

/// Errors raised by broker implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not reach the broker.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed a publish.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The broker rejected or failed a subscribe.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The broker connection went away.
    #[error("broker connection closed")]
    Closed,
}

/// A publish/subscribe channel abstraction keyed by channel name.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a payload to a channel.
    ///
    /// Returns once the broker has accepted the payload into the channel's
    /// order. The returned count is the number of subscribers it reached, when
    /// the broker reports it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError>;

    /// Subscribe to a channel.
    ///
    /// The subscription stays registered until the returned handle is dropped.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

/// One item received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A published payload.
    Payload(String),
    /// The subscriber fell behind and this many payloads were skipped.
    Lagged(u64),
}

/// Releases a subscription registration on drop.
pub(crate) type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

enum Source {
    Broadcast(broadcast::Receiver<String>),
    Queue(mpsc::UnboundedReceiver<String>),
}

/// A live subscription to one channel.
///
/// Dropping the handle releases the subscription at the broker.
pub struct Subscription {
    channel: String,
    source: Source,
    release: Option<ReleaseHook>,
}

impl Subscription {
    pub(crate) fn from_broadcast(channel: &str, receiver: broadcast::Receiver<String>) -> Self {
        Self {
            channel: channel.to_string(),
            source: Source::Broadcast(receiver),
            release: None,
        }
    }

    pub(crate) fn from_queue(
        channel: &str,
        receiver: mpsc::UnboundedReceiver<String>,
        release: ReleaseHook,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            source: Source::Queue(receiver),
            release: Some(release),
        }
    }

    /// The channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` when the subscription ended on the broker side
    /// (broker restart or lost connection).
    pub async fn recv(&mut self) -> Option<Delivery> {
        match &mut self.source {
            Source::Broadcast(receiver) => match receiver.recv().await {
                Ok(payload) => Some(Delivery::Payload(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some(Delivery::Lagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => None,
            },
            Source::Queue(receiver) => receiver.recv().await.map(Delivery::Payload),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Build the broker selected by the configuration.
pub fn from_config(config: &BrokerConfig) -> Arc<dyn Broker> {
    match config.kind {
        BrokerKind::Memory => Arc::new(MemoryBroker::new(config.channel_capacity)),
        BrokerKind::Tcp => Arc::new(TcpBroker::new(config.address.clone())),
    }
}
