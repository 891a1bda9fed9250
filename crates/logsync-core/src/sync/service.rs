//! Sync service
//!
//! The service accepts client connections and answers every PUBLISH with
//! exactly one reply:
//! - PUBACK when the bytes were appended at the offset the client claimed
//! - PUBNAK/RESET carrying the service's max offset when the offsets differ
//! - PUBNAK/FAILURE for anything else (disk errors, bad topic names)

use crate::registry::TrackerRegistry;
use crate::sync::SegmentChunk;
use crate::sync::config::SyncConfig;
use crate::tracker::AppendAt;
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use logsync_protocol::{Packet, PacketCodec};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::Framed;

/// Result of handling one PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Bytes stored; the client may advance
    Written,
    /// Offsets differ; the client must restart from the carried offset
    NeedsReset(u64),
    /// Not stored for a reason unrelated to offsets
    Failed(String),
}

/// Receiver of published segment bytes
pub trait PublishHandler: Send + Sync {
    /// Store `chunk`, which starts at `offset` of `topic`
    fn publish(&self, topic: &str, offset: u64, chunk: &SegmentChunk) -> PublishOutcome;
}

/// Appends published bytes verbatim to trackers of a registry
pub struct TrackerStoreHandler {
    registry: Arc<TrackerRegistry>,
    roll_size: u64,
}

impl TrackerStoreHandler {
    /// Store into `registry`, rolling segments past `roll_size`
    pub fn new(registry: Arc<TrackerRegistry>, roll_size: u64) -> Self {
        Self {
            registry,
            roll_size,
        }
    }
}

impl PublishHandler for TrackerStoreHandler {
    fn publish(&self, topic: &str, offset: u64, chunk: &SegmentChunk) -> PublishOutcome {
        let tracker = match self.registry.get(topic) {
            Ok(tracker) => tracker,
            Err(e) => return PublishOutcome::Failed(e.to_string()),
        };

        match tracker.append_at(offset, chunk.as_bytes(), self.roll_size) {
            Ok(AppendAt::Appended(_)) => PublishOutcome::Written,
            Ok(AppendAt::Mismatch { max_offset }) => PublishOutcome::NeedsReset(max_offset),
            Err(e) => {
                tracing::error!(topic, offset, error = %e, "failed to append published bytes");
                PublishOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Service statistics
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    /// Connections accepted
    pub connections: u64,
    /// Currently open connections
    pub active_connections: u32,
    /// PUBLISH packets received
    pub publishes: u64,
    /// Bytes stored
    pub bytes_received: u64,
    /// PUBACK replies
    pub acks: u64,
    /// PUBNAK/RESET replies
    pub resets: u64,
    /// PUBNAK/FAILURE replies
    pub failures: u64,
    /// Connections closed for a protocol violation
    pub protocol_errors: u64,
}

/// Per-topic receive counters
#[derive(Debug, Clone)]
pub struct TopicReceiveStats {
    /// Bytes stored for the topic
    pub bytes: u64,
    /// PUBLISH packets stored for the topic
    pub publishes: u64,
    /// Time of the last stored PUBLISH
    pub last_received: Instant,
}

/// Sync service accepting PUBLISH streams
pub struct SyncService {
    /// Configuration
    config: SyncConfig,
    /// Publish handlers, run in order
    handlers: RwLock<Vec<Arc<dyn PublishHandler>>>,
    /// Statistics
    stats: Mutex<ServiceStats>,
    /// Per-topic counters
    topics: DashMap<String, TopicReceiveStats>,
    /// Running flag
    running: AtomicBool,
    /// Bound address once started
    local_addr: Mutex<Option<SocketAddr>>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Tells open connections to close
    close_tx: watch::Sender<bool>,
}

impl SyncService {
    /// Create a service without handlers
    pub fn new(config: SyncConfig) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            config,
            handlers: RwLock::new(Vec::new()),
            stats: Mutex::new(ServiceStats::default()),
            topics: DashMap::new(),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            close_tx,
        }
    }

    /// Create a service storing into `registry`
    pub fn with_registry(config: SyncConfig, registry: Arc<TrackerRegistry>) -> Self {
        let roll_size = config.service_roll_size;
        let service = Self::new(config);
        service.add_handler(Arc::new(TrackerStoreHandler::new(registry, roll_size)));
        service
    }

    /// Register a publish handler
    pub fn add_handler(&self, handler: Arc<dyn PublishHandler>) {
        self.handlers.write().push(handler);
    }

    /// Configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Address the service listens on, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Check if the accept loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get service statistics
    pub fn stats(&self) -> ServiceStats {
        self.stats.lock().clone()
    }

    /// Receive counters of `topic`
    pub fn topic_stats(&self, topic: &str) -> Option<TopicReceiveStats> {
        self.topics.get(topic).map(|s| s.clone())
    }

    /// Bind and spawn the accept loop; returns the bound address
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::replication("Sync service already running"));
        }

        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!("Sync service listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.close_tx.send_replace(false);

        let service = self.clone();
        tokio::spawn(async move { service.accept_loop(listener, shutdown_rx).await });
        Ok(addr)
    }

    /// Stop accepting and close open connections
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        self.close_tx.send_replace(true);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = self.clone();
                            tokio::spawn(async move { service.handle_connection(stream, addr).await });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("Sync service shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        tracing::info!("Sync client connected from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        {
            let mut stats = self.stats.lock();
            stats.connections += 1;
            stats.active_connections += 1;
        }

        let mut close_rx = self.close_tx.subscribe();
        let mut framed = Framed::new(stream, PacketCodec::new());

        let result = if *close_rx.borrow_and_update() {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    frame = framed.next() => {
                        match frame {
                            Some(Ok(packet)) => {
                                if let Err(e) = self.handle_packet(&mut framed, packet, addr).await {
                                    break Err(e);
                                }
                            }
                            Some(Err(e)) => break Err(Error::from(e)),
                            None => break Ok(()),
                        }
                    }
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break Ok(());
                        }
                    }
                }
            }
        };

        match result {
            Ok(()) => tracing::info!("Sync client {} disconnected", addr),
            Err(e) => tracing::warn!("Sync client {} dropped: {}", addr, e),
        }
        self.stats.lock().active_connections -= 1;
    }

    async fn handle_packet(
        &self,
        framed: &mut Framed<TcpStream, PacketCodec>,
        packet: Packet,
        addr: SocketAddr,
    ) -> Result<()> {
        let kind = packet.name();
        let Packet::Publish {
            offset,
            topic,
            data,
        } = packet
        else {
            self.stats.lock().protocol_errors += 1;
            return Err(Error::replication(format!("unexpected {} from {}", kind, addr)));
        };

        let reply = self.publish(topic, offset, SegmentChunk::new(data)).await;
        framed.send(reply).await?;
        Ok(())
    }

    /// Run the handlers for one PUBLISH and build the reply
    async fn publish(&self, topic: Bytes, offset: u64, chunk: SegmentChunk) -> Packet {
        let length = chunk.len() as u64;
        self.stats.lock().publishes += 1;

        let outcome = match std::str::from_utf8(&topic) {
            Ok(name) => {
                let handlers = self.handlers.read().clone();
                let name = name.to_string();
                tokio::task::spawn_blocking(move || run_handlers(&handlers, &name, offset, &chunk))
                    .await
                    .unwrap_or_else(|e| PublishOutcome::Failed(format!("publish handler panicked: {}", e)))
            }
            Err(_) => PublishOutcome::Failed("topic is not valid UTF-8".to_string()),
        };

        let name = String::from_utf8_lossy(&topic).into_owned();
        match outcome {
            PublishOutcome::Written => {
                tracing::trace!(topic = %name, offset, length, "stored published bytes");
                {
                    let mut stats = self.stats.lock();
                    stats.acks += 1;
                    stats.bytes_received += length;
                }
                self.topics
                    .entry(name)
                    .and_modify(|s| {
                        s.bytes += length;
                        s.publishes += 1;
                        s.last_received = Instant::now();
                    })
                    .or_insert_with(|| TopicReceiveStats {
                        bytes: length,
                        publishes: 1,
                        last_received: Instant::now(),
                    });
                Packet::Ack { topic }
            }
            PublishOutcome::NeedsReset(max_offset) => {
                tracing::warn!(topic = %name, offset, max_offset, "offset mismatch, requesting reset");
                self.stats.lock().resets += 1;
                Packet::Reset {
                    topic,
                    offset: max_offset,
                }
            }
            PublishOutcome::Failed(reason) => {
                tracing::warn!(topic = %name, offset, reason = %reason, "publish failed");
                self.stats.lock().failures += 1;
                Packet::Failure { topic }
            }
        }
    }
}

fn run_handlers(
    handlers: &[Arc<dyn PublishHandler>],
    topic: &str,
    offset: u64,
    chunk: &SegmentChunk,
) -> PublishOutcome {
    if handlers.is_empty() {
        return PublishOutcome::Failed("no publish handler registered".to_string());
    }
    for handler in handlers {
        let outcome = handler.publish(topic, offset, chunk);
        if outcome != PublishOutcome::Written {
            return outcome;
        }
    }
    PublishOutcome::Written
}
