//! In-process broker built on tokio broadcast channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, Subscription};

/// Broker that keeps one broadcast channel per channel name.
///
/// Publish order per channel is the order in which `publish` calls take the
/// channel lock, so every subscriber sees the same sequence.
///
/// The fault hooks (`disconnect`, `fail_next_subscribes`, `set_publish_failure`)
/// let callers exercise resubscription and error paths without a network.
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
    failing_subscribes: AtomicUsize,
    failing_publishes: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker whose channels buffer `capacity` payloads per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            failing_subscribes: AtomicUsize::new(0),
            failing_publishes: AtomicBool::new(false),
        }
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock_channels()
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a channel, ending every subscription on it as a broker restart would.
    pub fn disconnect(&self, channel: &str) -> bool {
        self.lock_channels().remove(channel).is_some()
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Make publish calls fail until reset.
    pub fn set_publish_failure(&self, failing: bool) {
        self.failing_publishes.store(failing, Ordering::SeqCst);
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        // The map stays consistent even if a holder panicked.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_subscribe_failure(&self) -> bool {
        self.failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        if self.failing_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("broker unavailable".to_string()));
        }

        let mut channels = self.lock_channels();
        let Some(sender) = channels.get(channel) else {
            return Ok(0);
        };
        match sender.send(payload) {
            Ok(receivers) => Ok(receivers),
            // No receivers is not an error: nobody is listening on this channel.
            Err(_) => {
                channels.remove(channel);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        if self.take_subscribe_failure() {
            return Err(BrokerError::Subscribe(format!(
                "channel {channel} unavailable"
            )));
        }

        let mut channels = self.lock_channels();
        // Channels whose subscribers all left are dropped here, so the map
        // only holds rooms that are listened to.
        channels.retain(|_, sender| sender.receiver_count() > 0);
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(Subscription::from_broadcast(channel, sender.subscribe()))
    }
}
