//! Networked broker: a small pub/sub server and its client.
//!
//! The wire protocol is newline-delimited JSON. Every frame carries an `op`
//! tag:
//!
//! - client → server: `subscribe {channel, seq}`, `unsubscribe {channel}`,
//!   `publish {channel, payload, seq}`
//! - server → client: `message {channel, payload}`, `ack {seq, receivers}`,
//!   `error {seq, message}`
//!
//! The server fans each publish out to every subscribed connection while
//! holding its channel table lock, so one server is a single ordering domain
//! for all of its channels.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, Subscription};

/// Longest accepted frame in bytes.
const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Subscribe {
        channel: String,
        seq: u64,
    },
    Unsubscribe {
        channel: String,
    },
    Publish {
        channel: String,
        payload: String,
        seq: u64,
    },
    Message {
        channel: String,
        payload: String,
    },
    Ack {
        seq: u64,
        #[serde(default)]
        receivers: usize,
    },
    Error {
        seq: Option<u64>,
        message: String,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct ServerState {
    channels: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Frame>>>>,
    next_client: AtomicU64,
}

impl ServerState {
    fn subscribe(&self, channel: &str, client: u64, sender: mpsc::UnboundedSender<Frame>) {
        lock(&self.channels)
            .entry(channel.to_string())
            .or_default()
            .insert(client, sender);
    }

    fn unsubscribe(&self, channel: &str, client: u64) {
        let mut channels = lock(&self.channels);
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&client);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut channels = lock(&self.channels);
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };

        subscribers.retain(|_, sender| {
            sender
                .send(Frame::Message {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
        });
        let reached = subscribers.len();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        reached
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

/// Pub/sub server shared by relay processes.
pub struct BrokerServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl BrokerServer {
    /// Bind the broker server to an address ("host:port").
    pub async fn bind(address: &str) -> crate::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!("Broker server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: Arc::new(ServerState::default()),
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle used to inspect the server while it runs.
    pub fn stats(&self) -> BrokerServerStats {
        BrokerServerStats {
            state: self.state.clone(),
        }
    }

    /// Accept clients until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "Broker client connected");
                        let state = self.state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            serve_client(state, stream, addr, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept broker client"),
                }
            }
        }
        info!("Broker server stopped");
    }

    /// Run the server on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Read-only view of a running [`BrokerServer`].
#[derive(Clone)]
pub struct BrokerServerStats {
    state: Arc<ServerState>,
}

impl BrokerServerStats {
    /// Number of client connections subscribed to a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state.subscriber_count(channel)
    }
}

async fn serve_client(
    state: Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let client = state.next_client.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
    );
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(line) = serde_json::to_string(&frame) else {
                continue;
            };
            if writer.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = reader.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(peer = %addr, error = %e, "Broker client read error");
                break;
            }
            None => break,
        };

        let reply = match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Subscribe { channel, seq }) => {
                state.subscribe(&channel, client, tx.clone());
                subscribed.insert(channel);
                Frame::Ack { seq, receivers: 0 }
            }
            Ok(Frame::Unsubscribe { channel }) => {
                state.unsubscribe(&channel, client);
                subscribed.remove(&channel);
                continue;
            }
            Ok(Frame::Publish {
                channel,
                payload,
                seq,
            }) => {
                let receivers = state.publish(&channel, &payload);
                Frame::Ack { seq, receivers }
            }
            Ok(_) => Frame::Error {
                seq: None,
                message: "unexpected frame".to_string(),
            },
            Err(e) => Frame::Error {
                seq: None,
                message: format!("malformed frame: {e}"),
            },
        };

        if tx.send(reply).is_err() {
            break;
        }
    }

    for channel in &subscribed {
        state.unsubscribe(channel, client);
    }
    drop(tx);
    let _ = writer_task.await;
    debug!(peer = %addr, "Broker client disconnected");
}

// ============================================================================
// Client
// ============================================================================

type PendingReply = oneshot::Sender<Result<usize, BrokerError>>;

#[derive(Default)]
struct ClientShared {
    subscribers: HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>,
    pending: HashMap<u64, PendingReply>,
    closed: bool,
}

impl ClientShared {
    /// Fail everything waiting on this connection and end all subscriptions.
    fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(BrokerError::Closed));
        }
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Frame>,
    shared: Arc<Mutex<ClientShared>>,
    next_seq: AtomicU64,
    next_subscriber: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    async fn open(address: &str) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| BrokerError::Connection(format!("{address}: {e}")))?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Mutex::new(ClientShared::default()));
        let closed = CancellationToken::new();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Frame>();

        let mut writer = FramedWrite::new(write_half, LinesCodec::new());
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                let Ok(line) = serde_json::to_string(&frame) else {
                    continue;
                };
                if writer.send(line).await.is_err() {
                    writer_closed.cancel();
                    break;
                }
            }
        });

        let mut reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
        );
        let reader_shared = shared.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    line = reader.next() => line,
                };
                let Some(Ok(line)) = line else { break };

                match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Message { channel, payload }) => {
                        let mut shared = lock(&reader_shared);
                        if let Some(subscribers) = shared.subscribers.get_mut(&channel) {
                            subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
                        }
                    }
                    Ok(Frame::Ack { seq, receivers }) => {
                        if let Some(reply) = lock(&reader_shared).pending.remove(&seq) {
                            let _ = reply.send(Ok(receivers));
                        }
                    }
                    Ok(Frame::Error {
                        seq: Some(seq),
                        message,
                    }) => {
                        if let Some(reply) = lock(&reader_shared).pending.remove(&seq) {
                            let _ = reply.send(Err(BrokerError::Publish(message)));
                        }
                    }
                    Ok(Frame::Error { seq: None, message }) => {
                        warn!(%message, "Broker reported an error");
                    }
                    Ok(other) => debug!(?other, "Ignoring unexpected broker frame"),
                    Err(e) => warn!(error = %e, "Malformed frame from broker"),
                }
            }

            reader_closed.cancel();
            lock(&reader_shared).close();
            debug!("Broker connection closed");
        });

        Ok(Self {
            outgoing,
            shared,
            next_seq: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a frame that expects an ack and wait for it.
    async fn request(&self, seq: u64, frame: Frame) -> Result<usize, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return Err(BrokerError::Closed);
            }
            shared.pending.insert(seq, reply_tx);
        }

        if self.outgoing.send(frame).is_err() {
            lock(&self.shared).pending.remove(&seq);
            return Err(BrokerError::Closed);
        }

        reply_rx.await.map_err(|_| BrokerError::Closed)?
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Client for a [`BrokerServer`].
///
/// Connects lazily and reconnects on the next call after the connection is
/// lost. Losing the connection ends every subscription made through it, so
/// subscribers notice and resubscribe.
pub struct TcpBroker {
    address: String,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl TcpBroker {
    /// Create a client for the broker at `address`. No connection is made yet.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a client and connect immediately.
    pub async fn connect(address: impl Into<String>) -> Result<Self, BrokerError> {
        let broker = Self::new(address);
        broker.connection().await?;
        Ok(broker)
    }

    async fn connection(&self) -> Result<Arc<Connection>, BrokerError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let conn = Arc::new(Connection::open(&self.address).await?);
        debug!(address = %self.address, "Connected to broker");
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        let conn = self.connection().await?;
        let seq = conn.next_seq.fetch_add(1, Ordering::Relaxed);
        conn.request(
            seq,
            Frame::Publish {
                channel: channel.to_string(),
                payload,
                seq,
            },
        )
        .await
        .map_err(|e| match e {
            BrokerError::Closed => BrokerError::Publish("broker connection closed".to_string()),
            other => other,
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let conn = self.connection().await?;
        let id = conn.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let first = {
            let mut shared = lock(&conn.shared);
            if shared.closed {
                return Err(BrokerError::Subscribe("broker connection closed".to_string()));
            }
            let local = shared.subscribers.entry(channel.to_string()).or_default();
            let first = local.is_empty();
            local.insert(id, tx);
            first
        };

        let release_shared = conn.shared.clone();
        let release_outgoing = conn.outgoing.clone();
        let release_channel = channel.to_string();
        let subscription = Subscription::from_queue(
            channel,
            rx,
            Box::new(move || {
                let mut shared = lock(&release_shared);
                let now_empty = match shared.subscribers.get_mut(&release_channel) {
                    Some(local) => {
                        local.remove(&id);
                        local.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    shared.subscribers.remove(&release_channel);
                    let _ = release_outgoing.send(Frame::Unsubscribe {
                        channel: release_channel,
                    });
                }
            }),
        );

        if first {
            let seq = conn.next_seq.fetch_add(1, Ordering::Relaxed);
            conn.request(
                seq,
                Frame::Subscribe {
                    channel: channel.to_string(),
                    seq,
                },
            )
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        }

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Delivery;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_server() -> (String, BrokerServerStats, CancellationToken) {
        let server = BrokerServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let stats = server.stats();
        let shutdown = CancellationToken::new();
        server.spawn(shutdown.clone());
        (addr, stats, shutdown)
    }

    async fn next(sub: &mut Subscription) -> Option<Delivery> {
        timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for delivery")
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Publish {
            channel: "chat_channel:r1".to_string(),
            payload: "{}".to_string(),
            seq: 7,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"publish\""));
        assert!(json.contains("\"seq\":7"));

        let parsed: Frame = serde_json::from_str(r#"{"op":"ack","seq":3}"#).unwrap();
        assert_eq!(
            parsed,
            Frame::Ack {
                seq: 3,
                receivers: 0
            }
        );
    }

    #[tokio::test]
    async fn test_publish_crosses_clients() {
        let (addr, _stats, shutdown) = start_server().await;

        let process_a = TcpBroker::connect(addr.clone()).await.unwrap();
        let process_b = TcpBroker::connect(addr).await.unwrap();

        let mut sub_a = process_a.subscribe("room").await.unwrap();
        let mut sub_b = process_b.subscribe("room").await.unwrap();

        let reached = process_a.publish("room", "hello".to_string()).await.unwrap();
        assert_eq!(reached, 2);

        assert_eq!(
            next(&mut sub_a).await,
            Some(Delivery::Payload("hello".to_string()))
        );
        assert_eq!(
            next(&mut sub_b).await,
            Some(Delivery::Payload("hello".to_string()))
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_order_is_preserved_across_publishers() {
        let (addr, _stats, shutdown) = start_server().await;

        let subscriber = TcpBroker::connect(addr.clone()).await.unwrap();
        let publisher = TcpBroker::connect(addr).await.unwrap();
        let mut sub = subscriber.subscribe("room").await.unwrap();

        for i in 0..20 {
            publisher.publish("room", format!("m{i}")).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(
                next(&mut sub).await,
                Some(Delivery::Payload(format!("m{i}")))
            );
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dropping_last_local_subscription_unsubscribes() {
        let (addr, stats, shutdown) = start_server().await;
        let broker = TcpBroker::connect(addr).await.unwrap();

        let a = broker.subscribe("room").await.unwrap();
        let b = broker.subscribe("room").await.unwrap();
        assert_eq!(stats.subscriber_count("room"), 1);

        drop(a);
        drop(b);

        // Unsubscribe is fire-and-forget; a publish round trip orders after it.
        broker.publish("other", "sync".to_string()).await.unwrap();
        assert_eq!(stats.subscriber_count("room"), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_server_shutdown_ends_subscriptions() {
        let (addr, _stats, shutdown) = start_server().await;
        let broker = TcpBroker::connect(addr).await.unwrap();
        let mut sub = broker.subscribe("room").await.unwrap();

        shutdown.cancel();

        assert_eq!(next(&mut sub).await, None);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let broker = TcpBroker::new(addr);
        assert!(matches!(
            broker.publish("room", "x".to_string()).await,
            Err(BrokerError::Connection(_))
        ));
        assert!(broker.subscribe("room").await.is_err());
    }
}
