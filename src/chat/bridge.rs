//! Per-room bridge from a broker channel to the local connections.
//!
//! One bridge task runs per occupied room. It owns the broker subscription
//! and hands every payload to [`ConnectionRegistry`] for local fan-out.
//! When the subscription ends while the room is still occupied, the bridge
//! resubscribes with exponential backoff and marks the room degraded if the
//! attempts run out.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Delivery, Subscription};
use crate::config::BrokerConfig;

use super::message::{channel_name, ChatPayload, RoomState, ServerFrame};
use super::registry::{degraded_notice, ConnectionRegistry};

/// Resubscription policy of the bridges.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Tries before the room is marked degraded.
    pub resubscribe_attempts: u32,
    /// Delay after the first failed try.
    pub initial_backoff: Duration,
    /// Upper bound for the delay between tries.
    pub max_backoff: Duration,
    /// Give up (instead of retrying) when the very first subscribe fails.
    pub fail_fast: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for BridgeSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            resubscribe_attempts: config.resubscribe_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            fail_fast: config.fail_fast,
        }
    }
}

/// Handle the registry keeps for a running bridge.
#[derive(Debug)]
pub(crate) struct BridgeHandle {
    id: u64,
    cancel: CancellationToken,
    status: watch::Receiver<RoomState>,
}

impl BridgeHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> RoomState {
        *self.status.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<RoomState> {
        self.status.clone()
    }

    /// Stop the bridge. Idempotent.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

enum PumpEnd {
    Cancelled,
    SubscriptionEnded,
}

/// Listener task for one room.
pub(crate) struct ChannelBridge {
    id: u64,
    room_id: String,
    channel: String,
    broker: Arc<dyn Broker>,
    registry: Weak<ConnectionRegistry>,
    settings: BridgeSettings,
    cancel: CancellationToken,
    status: watch::Sender<RoomState>,
}

impl ChannelBridge {
    /// Start a bridge for `room_id` on a new task.
    pub(crate) fn spawn(
        id: u64,
        room_id: &str,
        broker: Arc<dyn Broker>,
        registry: Weak<ConnectionRegistry>,
        settings: BridgeSettings,
        cancel: CancellationToken,
    ) -> BridgeHandle {
        let (status, status_rx) = watch::channel(RoomState::Starting);
        let bridge = Self {
            id,
            room_id: room_id.to_string(),
            channel: channel_name(room_id),
            broker,
            registry,
            settings,
            cancel: cancel.clone(),
            status,
        };

        tokio::spawn(bridge.run());

        BridgeHandle {
            id,
            cancel,
            status: status_rx,
        }
    }

    async fn run(self) {
        debug!(room_id = %self.room_id, bridge_id = self.id, "Channel bridge started");

        let mut initial = true;
        while let Some(subscription) = self.connect(initial).await {
            initial = false;
            match self.pump(subscription).await {
                PumpEnd::Cancelled => break,
                PumpEnd::SubscriptionEnded => {
                    warn!(room_id = %self.room_id, "Broker subscription ended; resubscribing");
                }
            }
        }

        debug!(room_id = %self.room_id, bridge_id = self.id, "Channel bridge stopped");
    }

    /// Subscribe, retrying with backoff. `None` means the bridge should stop.
    async fn connect(&self, initial: bool) -> Option<Subscription> {
        let mut attempt: u32 = 0;
        let mut backoff = self.settings.initial_backoff;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.broker.subscribe(&self.channel) => result,
            };

            match result {
                Ok(subscription) => {
                    self.set_healthy().await;
                    return Some(subscription);
                }
                Err(e) if initial && self.settings.fail_fast => {
                    warn!(room_id = %self.room_id, error = %e, "Initial subscribe failed");
                    self.status.send_replace(RoomState::Failed);
                    return None;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        room_id = %self.room_id,
                        attempt,
                        error = %e,
                        "Subscribe failed"
                    );
                    if attempt == self.settings.resubscribe_attempts {
                        self.set_degraded().await;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }

    /// Forward deliveries until cancelled or the subscription ends.
    ///
    /// The subscription is dropped on return, releasing it at the broker.
    async fn pump(&self, mut subscription: Subscription) -> PumpEnd {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                delivery = subscription.recv() => delivery,
            };

            match delivery {
                Some(Delivery::Payload(payload)) => {
                    let frame = match serde_json::from_str::<ChatPayload>(&payload) {
                        Ok(message) => ServerFrame::Message(message),
                        Err(e) => {
                            warn!(room_id = %self.room_id, error = %e, "Dropping malformed payload");
                            continue;
                        }
                    };
                    let Some(registry) = self.registry.upgrade() else {
                        return PumpEnd::Cancelled;
                    };
                    registry.deliver(&self.room_id, Some(self.id), &frame).await;
                }
                Some(Delivery::Lagged(skipped)) => {
                    warn!(room_id = %self.room_id, skipped, "Bridge fell behind the broker");
                }
                None => return PumpEnd::SubscriptionEnded,
            }
        }
    }

    async fn set_healthy(&self) {
        let room_id = &self.room_id;
        self.transition(|status| {
            let previous = status.send_replace(RoomState::Healthy);
            (previous == RoomState::Degraded).then(|| {
                info!(%room_id, "Room recovered");
                ServerFrame::RoomStatus {
                    status: RoomState::Healthy,
                }
            })
        })
        .await;
    }

    async fn set_degraded(&self) {
        let room_id = &self.room_id;
        self.transition(|status| {
            let previous = status.send_replace(RoomState::Degraded);
            (previous != RoomState::Degraded).then(|| {
                warn!(%room_id, "Room degraded; messages are not fanned out");
                degraded_notice()
            })
        })
        .await;
    }

    /// Change the room state together with the registry, so joiners see
    /// either the new state or the announcement.
    async fn transition<F>(&self, change: F)
    where
        F: FnOnce(&watch::Sender<RoomState>) -> Option<ServerFrame>,
    {
        match self.registry.upgrade() {
            Some(registry) => {
                registry
                    .transition(&self.room_id, self.id, || change(&self.status))
                    .await;
            }
            None => {
                change(&self.status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = BrokerConfig {
            resubscribe_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 10,
            fail_fast: true,
            ..BrokerConfig::default()
        };
        let settings = BridgeSettings::from(&config);

        assert_eq!(settings.resubscribe_attempts, 3);
        assert_eq!(settings.initial_backoff, Duration::from_millis(50));
        // The cap never undercuts the initial delay.
        assert_eq!(settings.max_backoff, Duration::from_millis(50));
        assert!(settings.fail_fast);
    }

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.resubscribe_attempts, 5);
        assert!(!settings.fail_fast);
    }
}
