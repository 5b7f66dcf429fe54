//! Per-connection receive loop: validate, persist, publish.
//!
//! Ingress never hands a message to local connections directly. Every
//! message goes through the broker, and local connections receive it from
//! the room's bridge, so all processes observe the same order.
//!
//! Pipelines of one room share a publish-order lock held from `save` to
//! `publish`, so within a process the broker sees a room's messages in id
//! order.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::db::{Message, NewMessage};

use super::message::{channel_name, ChatPayload, ErrorCode, ServerFrame};
use super::registry::{ConnectionHandle, OutboundFrame};
use super::store::MessageStore;

/// A frame received from a client, reduced to what ingress cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Close,
}

/// Why a message from a client was not relayed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngressError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("message is longer than {max} characters")]
    MessageTooLong { max: usize },

    /// Nothing was published.
    #[error("message could not be stored: {0}")]
    Persist(String),

    /// The message is stored under `message_id` but was not published.
    #[error("message {message_id} was stored but not delivered: {reason}")]
    Publish { message_id: i64, reason: String },
}

impl IngressError {
    /// Code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            IngressError::EmptyMessage => ErrorCode::EmptyMessage,
            IngressError::MessageTooLong { .. } => ErrorCode::MessageTooLong,
            IngressError::Persist(_) => ErrorCode::PersistFailed,
            IngressError::Publish { .. } => ErrorCode::PublishFailed,
        }
    }

    /// Error frame sent back to the sender.
    pub fn to_frame(&self) -> ServerFrame {
        let (message, message_id) = match self {
            // Storage details stay in the log.
            IngressError::Persist(_) => ("message could not be stored".to_string(), None),
            IngressError::Publish { message_id, .. } => (
                "message was stored but could not be delivered".to_string(),
                Some(*message_id),
            ),
            other => (other.to_string(), None),
        };
        ServerFrame::Error {
            code: self.code(),
            message,
            message_id,
        }
    }
}

/// How the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressEnd {
    /// The client closed the connection or the transport ended.
    ClientClosed,
    /// The process is shutting down.
    Shutdown,
}

/// Persist-then-publish pipeline for one connection.
pub struct IngressPipeline {
    room_id: String,
    channel: String,
    sender: String,
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn Broker>,
    max_message_length: usize,
    publish_order: Arc<Mutex<()>>,
}

impl IngressPipeline {
    pub fn new(
        room_id: &str,
        sender: &str,
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn Broker>,
        max_message_length: usize,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            channel: channel_name(room_id),
            sender: sender.to_string(),
            store,
            broker,
            max_message_length,
            publish_order: Arc::default(),
        }
    }

    /// Share the room's publish-order lock with the other pipelines of the
    /// room.
    pub fn with_publish_order(mut self, publish_order: Arc<Mutex<()>>) -> Self {
        self.publish_order = publish_order;
        self
    }

    /// Relay one text message: persist it, then publish it.
    pub async fn handle_text(&self, content: String) -> Result<Message, IngressError> {
        if content.trim().is_empty() {
            return Err(IngressError::EmptyMessage);
        }
        if content.chars().count() > self.max_message_length {
            return Err(IngressError::MessageTooLong {
                max: self.max_message_length,
            });
        }

        let _order = self.publish_order.lock().await;

        let message = self
            .store
            .save(NewMessage::new(&self.room_id, &self.sender, content))
            .await
            .map_err(|e| {
                warn!(room_id = %self.room_id, error = %e, "Failed to persist message");
                IngressError::Persist(e.to_string())
            })?;

        let payload = serde_json::to_string(&ChatPayload::from(&message))
            .map_err(|e| IngressError::Publish {
                message_id: message.id,
                reason: e.to_string(),
            })?;

        match self.broker.publish(&self.channel, payload).await {
            Ok(receivers) => {
                debug!(
                    room_id = %self.room_id,
                    message_id = message.id,
                    receivers,
                    "Message published"
                );
                Ok(message)
            }
            Err(e) => {
                warn!(
                    room_id = %self.room_id,
                    message_id = message.id,
                    error = %e,
                    "Failed to publish persisted message"
                );
                Err(IngressError::Publish {
                    message_id: message.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Process client frames until the client leaves or `shutdown` fires.
    ///
    /// Errors are reported to `connection` as error frames; none ends the loop.
    pub async fn run<S>(
        &self,
        inbound: &mut S,
        connection: &ConnectionHandle,
        shutdown: &CancellationToken,
    ) -> IngressEnd
    where
        S: Stream<Item = InboundFrame> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return IngressEnd::Shutdown,
                frame = inbound.next() => frame,
            };

            match frame {
                Some(InboundFrame::Text(content)) => {
                    if let Err(e) = self.handle_text(content).await {
                        connection.send_frame(&e.to_frame());
                    }
                }
                Some(InboundFrame::Ping(data)) => {
                    connection.send(OutboundFrame::Pong(data));
                }
                Some(InboundFrame::Binary(data)) => {
                    debug!(
                        connection_id = %connection.id(),
                        len = data.len(),
                        "Ignoring binary frame"
                    );
                }
                Some(InboundFrame::Close) | None => return IngressEnd::ClientClosed,
            }
        }
    }
}
