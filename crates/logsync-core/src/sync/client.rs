//! Sync client
//!
//! The client owns one connection to a sync service and multiplexes every
//! registered topic over it. Each topic has at most one PUBLISH in flight;
//! its cursor advances only when the matching PUBACK arrives, so after any
//! disconnect publishing resumes from the last acknowledged offset.
//!
//! New data wakes the connection task through a channel fed by tracker data
//! listeners. Replies are handled as follows:
//! - PUBACK: offset stores are told the new offset, then the cursor consumes
//!   the chunk and the next PUBLISH goes out
//! - PUBNAK/RESET: the cursor is re-seeked to the service's offset
//! - PUBNAK/FAILURE: the same region is re-sent after a backoff

use crate::consumer::{ConsumerCursor, SegmentRegion};
use crate::retry::Backoff;
use crate::sync::SegmentChunk;
use crate::sync::config::SyncConfig;
use crate::sync::offset_store::OffsetStore;
use crate::tracker::{ListenerId, TopicLogTracker};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use logsync_protocol::{Packet, PacketCodec};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

type Connection = Framed<TcpStream, PacketCodec>;

/// Client statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// PUBLISH packets sent
    pub publishes: u64,
    /// Bytes sent in PUBLISH packets
    pub bytes_published: u64,
    /// PUBACK replies
    pub acks: u64,
    /// PUBNAK/RESET replies
    pub resets: u64,
    /// PUBNAK/FAILURE replies
    pub failures: u64,
    /// Number of reconnects
    pub reconnects: u32,
    /// Is connected to the service
    pub connected: bool,
    /// Time of the last PUBACK
    pub last_ack_time: Option<Instant>,
}

/// Replication progress of one topic
#[derive(Debug, Clone)]
pub struct TopicProgress {
    /// Topic name
    pub topic: String,
    /// Acknowledged offset
    pub offset: u64,
    /// Max offset of the local log
    pub max_offset: u64,
    /// Bytes sent for this topic
    pub published_bytes: u64,
    /// Bytes acknowledged for this topic
    pub acked_bytes: u64,
    /// A PUBLISH is waiting for its reply
    pub waiting: bool,
    /// Publishing stopped after a fatal cursor error
    pub halted: bool,
    /// Time of the last PUBLISH
    pub last_publish: Option<Instant>,
}

struct LogState {
    topic: Bytes,
    tracker: Arc<TopicLogTracker>,
    cursor: Arc<ConsumerCursor>,
    listener: ListenerId,
    /// Set while a PUBLISH is outstanding
    waiting_since: Option<Instant>,
    /// Length of the outstanding PUBLISH
    last_chunk: u64,
    retry_at: Option<Instant>,
    /// Consecutive failures
    failures: u32,
    halted: bool,
    published_bytes: u64,
    acked_bytes: u64,
    last_publish: Option<Instant>,
}

impl LogState {
    fn clear_waiting(&mut self) {
        self.waiting_since = None;
        self.last_chunk = 0;
    }

    fn progress(&self, topic: &str) -> TopicProgress {
        TopicProgress {
            topic: topic.to_string(),
            offset: self.cursor.offset(),
            max_offset: self.cursor.max_offset(),
            published_bytes: self.published_bytes,
            acked_bytes: self.acked_bytes,
            waiting: self.waiting_since.is_some(),
            halted: self.halted,
            last_publish: self.last_publish,
        }
    }
}

/// Wake channel holding each topic at most once
#[derive(Clone)]
struct TopicWaker {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<DashSet<String>>,
}

impl TopicWaker {
    fn wake(&self, topic: &str) {
        if !self.pending.contains(topic) && self.pending.insert(topic.to_string()) {
            let _ = self.tx.send(topic.to_string());
        }
    }

    /// Called once `topic` is taken off the channel
    fn taken(&self, topic: &str) {
        self.pending.remove(topic);
    }
}

/// Client streaming local topics to a sync service
pub struct SyncClient {
    /// Configuration
    config: SyncConfig,
    /// Registered topics
    logs: Mutex<HashMap<String, LogState>>,
    /// Receivers of acknowledged offsets
    offset_stores: RwLock<Vec<Arc<dyn OffsetStore>>>,
    /// Wakes the connection task for a topic
    waker: TopicWaker,
    /// Taken by the running connection task
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Statistics
    stats: Mutex<ClientStats>,
    /// Running flag
    running: AtomicBool,
    /// Connected flag
    connected: AtomicBool,
    /// Shutdown signal sender
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SyncClient {
    /// Create a client
    pub fn new(config: SyncConfig) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            config,
            logs: Mutex::new(HashMap::new()),
            offset_stores: RwLock::new(Vec::new()),
            waker: TopicWaker {
                tx: wake_tx,
                pending: Arc::new(DashSet::new()),
            },
            wake_rx: Mutex::new(Some(wake_rx)),
            stats: Mutex::new(ClientStats::default()),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a store told about every acknowledged offset
    pub fn add_offset_store(&self, store: Arc<dyn OffsetStore>) {
        self.offset_stores.write().push(store);
    }

    /// Create a cursor on `tracker` at `start_offset` and replicate from it
    pub fn register(
        &self,
        tracker: &Arc<TopicLogTracker>,
        start_offset: u64,
    ) -> Result<Arc<ConsumerCursor>> {
        let cursor = tracker.new_consumer(self.config.client_name.clone(), start_offset)?;
        if let Err(e) = self.add(cursor.clone()) {
            tracker.remove_consumer(&cursor);
            return Err(e);
        }
        Ok(cursor)
    }

    /// Replicate the topic of `cursor`, starting at its current offset
    pub fn add(&self, cursor: Arc<ConsumerCursor>) -> Result<()> {
        let tracker = cursor.tracker().ok_or_else(|| {
            Error::replication(format!("{}: tracker of cursor {} is gone", cursor.topic(), cursor.name()))
        })?;
        let topic = cursor.topic().to_string();

        {
            let mut logs = self.logs.lock();
            if logs.contains_key(&topic) {
                return Err(Error::replication(format!("topic {} is already registered", topic)));
            }

            let waker = self.waker.clone();
            let listener = tracker.add_data_listener(Arc::new(move |topic: &str, _max_offset: u64| {
                waker.wake(topic);
            }));

            tracing::debug!(topic = %topic, offset = cursor.offset(), "registered topic for sync");
            logs.insert(
                topic.clone(),
                LogState {
                    topic: Bytes::copy_from_slice(topic.as_bytes()),
                    tracker,
                    cursor,
                    listener,
                    waiting_since: None,
                    last_chunk: 0,
                    retry_at: None,
                    failures: 0,
                    halted: false,
                    published_bytes: 0,
                    acked_bytes: 0,
                    last_publish: None,
                },
            );
        }

        self.waker.wake(&topic);
        Ok(())
    }

    /// Stop replicating the topic of `cursor` and unregister the cursor from
    /// its tracker; returns false if `cursor` was not registered here
    pub fn remove(&self, cursor: &Arc<ConsumerCursor>) -> bool {
        let removed = {
            let mut logs = self.logs.lock();
            match logs.get(cursor.topic()) {
                Some(log) if Arc::ptr_eq(&log.cursor, cursor) => logs.remove(cursor.topic()),
                _ => None,
            }
        };
        let Some(log) = removed else {
            return false;
        };

        log.tracker.remove_data_listener(log.listener);
        log.tracker.remove_consumer(&log.cursor);
        tracing::debug!(topic = cursor.topic(), "removed topic from sync");
        true
    }

    /// Cursor replicating `topic`
    pub fn cursor(&self, topic: &str) -> Option<Arc<ConsumerCursor>> {
        self.logs.lock().get(topic).map(|log| log.cursor.clone())
    }

    /// Registered topic names
    pub fn topics(&self) -> Vec<String> {
        self.logs.lock().keys().cloned().collect()
    }

    /// Progress of `topic`
    pub fn progress(&self, topic: &str) -> Option<TopicProgress> {
        self.logs.lock().get(topic).map(|log| log.progress(topic))
    }

    /// Progress of every registered topic
    pub fn progress_all(&self) -> Vec<TopicProgress> {
        self.logs
            .lock()
            .iter()
            .map(|(topic, log)| log.progress(topic))
            .collect()
    }

    /// Bytes not yet acknowledged, over all topics
    pub fn pending_bytes(&self) -> u64 {
        self.logs
            .lock()
            .values()
            .map(|log| log.cursor.max_offset().saturating_sub(log.cursor.offset()))
            .sum()
    }

    /// True when every byte of every topic is acknowledged
    pub fn is_caught_up(&self) -> bool {
        self.logs.lock().values().all(|log| {
            log.waiting_since.is_none() && log.cursor.offset() == log.cursor.max_offset()
        })
    }

    /// Check if connected to the service
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get client statistics
    pub fn stats(&self) -> ClientStats {
        self.stats.lock().clone()
    }

    /// Connect and replicate until [`stop`](Self::stop) is called or the
    /// retry policy gives up
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::replication("Sync client already running"));
        }

        let Some(remote) = self.config.remote_addr.clone() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::config("Remote address not configured"));
        };
        let Some(mut wake_rx) = self.wake_rx.lock().take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::replication("Sync client wake channel already taken"));
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let mut backoff = Backoff::new(self.config.retry.clone());
        let result = 'session: loop {
            let outcome = tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Sync client shutting down");
                    break 'session Ok(());
                }
                outcome = self.connect_and_sync(&remote, &mut wake_rx, &mut backoff) => outcome,
            };

            match outcome {
                Ok(()) => tracing::info!("Sync service at {} closed the connection", remote),
                Err(e) => tracing::error!("Sync error: {}", e),
            }
            self.disconnected();

            let Some(delay) = backoff.next_delay() else {
                break 'session Err(Error::replication(format!(
                    "giving up on {} after {} attempts",
                    remote,
                    backoff.attempts()
                )));
            };
            tracing::info!("Reconnecting to {} in {:?}", remote, delay);
            self.stats.lock().reconnects += 1;

            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Sync client shutting down");
                    break 'session Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.disconnected();
        *self.wake_rx.lock() = Some(wake_rx);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Stop the client
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    async fn connect_and_sync(
        &self,
        remote: &str,
        wake_rx: &mut mpsc::UnboundedReceiver<String>,
        backoff: &mut Backoff,
    ) -> Result<()> {
        tracing::info!("Connecting to sync service at {}", remote);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| Error::replication("Connection timeout"))??;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, PacketCodec::new());

        self.connected.store(true, Ordering::SeqCst);
        self.stats.lock().connected = true;
        backoff.reset();
        tracing::info!("Connected to sync service at {}", remote);

        // every topic is tried below
        while let Ok(topic) = wake_rx.try_recv() {
            self.waker.taken(&topic);
        }
        for topic in self.topics() {
            self.try_publish(&mut framed, &topic).await?;
        }

        let period = (self.config.ack_warning / 2).max(Duration::from_millis(100));
        let mut ack_check = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(packet)) => self.handle_reply(&mut framed, packet).await?,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                Some(topic) = wake_rx.recv() => {
                    self.waker.taken(&topic);
                    self.try_publish(&mut framed, &topic).await?;
                }
                _ = ack_check.tick() => {
                    self.check_outstanding_acks();
                }
            }
        }
    }

    /// Forget outstanding PUBLISHes so the next connection re-sends them
    fn disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stats.lock().connected = false;
        for log in self.logs.lock().values_mut() {
            log.clear_waiting();
            log.retry_at = None;
        }
    }

    /// Send the next region of `topic` unless one is in flight
    async fn try_publish(&self, framed: &mut Connection, topic: &str) -> Result<()> {
        let Some((topic_bytes, region)) = self.next_publish(topic) else {
            return Ok(());
        };

        let chunk = match read_region(&region).await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::error!(
                    topic,
                    file = region.file.name(),
                    position = region.position,
                    error = %e,
                    "failed to read segment region"
                );
                if let Some(log) = self.logs.lock().get_mut(topic) {
                    log.clear_waiting();
                    self.schedule_retry(topic, log);
                }
                return Ok(());
            }
        };

        tracing::trace!(topic, offset = region.offset, length = region.length, "PUBLISH");
        let length = chunk.len() as u64;
        framed
            .send(Packet::Publish {
                offset: region.offset,
                topic: topic_bytes,
                data: chunk.into_bytes(),
            })
            .await?;

        let mut stats = self.stats.lock();
        stats.publishes += 1;
        stats.bytes_published += length;
        Ok(())
    }

    fn next_publish(&self, topic: &str) -> Option<(Bytes, SegmentRegion)> {
        let mut logs = self.logs.lock();
        let log = logs.get_mut(topic)?;
        if log.halted || log.waiting_since.is_some() {
            return None;
        }
        let now = Instant::now();
        if log.retry_at.is_some_and(|at| at > now) {
            return None;
        }
        log.retry_at = None;

        match log.cursor.next_region(self.config.chunk_size) {
            Ok(Some(region)) => {
                log.waiting_since = Some(now);
                log.last_chunk = region.length;
                log.published_bytes += region.length;
                log.last_publish = Some(now);
                Some((log.topic.clone(), region))
            }
            Ok(None) => None,
            Err(e) => {
                self.cursor_failed(topic, log, &e);
                None
            }
        }
    }

    async fn handle_reply(&self, framed: &mut Connection, packet: Packet) -> Result<()> {
        let topic = match std::str::from_utf8(packet.topic()) {
            Ok(topic) => topic.to_string(),
            Err(_) => return Err(Error::replication("reply for a topic that is not UTF-8")),
        };

        match packet {
            Packet::Ack { .. } => self.on_ack(&topic).await?,
            Packet::Reset { offset, .. } => self.on_reset(&topic, offset).await?,
            Packet::Failure { .. } => self.on_failure(&topic),
            Packet::Publish { .. } => {
                return Err(Error::replication("unexpected PUBLISH from sync service"));
            }
        }

        self.try_publish(framed, &topic).await
    }

    /// Cursor of `topic` if a PUBLISH is outstanding for it
    fn outstanding(&self, topic: &str, reply: &str) -> Option<(Arc<ConsumerCursor>, u64)> {
        let logs = self.logs.lock();
        let Some(log) = logs.get(topic) else {
            tracing::debug!(topic, "{} for unregistered topic", reply);
            return None;
        };
        if log.waiting_since.is_none() {
            tracing::warn!(topic, "{} without an outstanding PUBLISH", reply);
            return None;
        }
        Some((log.cursor.clone(), log.last_chunk))
    }

    /// Run every offset store on the blocking pool
    async fn store_offset(&self, topic: &str, offset: u64) -> Result<()> {
        let stores = self.offset_stores.read().clone();
        if stores.is_empty() {
            return Ok(());
        }
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            stores
                .iter()
                .try_for_each(|store| store.store(&topic, offset))
        })
        .await
        .map_err(|e| Error::replication(format!("offset store panicked: {}", e)))?
    }

    async fn on_ack(&self, topic: &str) -> Result<()> {
        let Some((cursor, chunk)) = self.outstanding(topic, "PUBACK") else {
            return Ok(());
        };

        let offset = cursor.offset() + chunk;
        self.store_offset(topic, offset).await?;
        let consumed = cursor.consume(chunk);
        tracing::debug!(topic, offset, "PUBACK");

        {
            let mut stats = self.stats.lock();
            stats.acks += 1;
            stats.last_ack_time = Some(Instant::now());
        }

        let mut logs = self.logs.lock();
        if let Some(log) = logs.get_mut(topic) {
            log.clear_waiting();
            log.failures = 0;
            match consumed {
                Ok(()) => log.acked_bytes += chunk,
                Err(e) => self.cursor_failed(topic, log, &e),
            }
        }
        Ok(())
    }

    async fn on_reset(&self, topic: &str, offset: u64) -> Result<()> {
        let Some((cursor, _)) = self.outstanding(topic, "PUBNAK/RESET") else {
            return Ok(());
        };

        tracing::warn!(
            topic,
            offset = cursor.offset(),
            service_offset = offset,
            "service requested reset"
        );
        self.stats.lock().resets += 1;

        self.store_offset(topic, offset).await?;
        let repositioned = cursor.set_offset(offset);

        let mut logs = self.logs.lock();
        if let Some(log) = logs.get_mut(topic) {
            log.clear_waiting();
            if let Err(e) = repositioned {
                self.cursor_failed(topic, log, &e);
            } else {
                tracing::info!(topic, offset, "cursor reset to service offset");
            }
        }
        Ok(())
    }

    fn on_failure(&self, topic: &str) {
        if self.outstanding(topic, "PUBNAK/FAILURE").is_none() {
            return;
        }
        self.stats.lock().failures += 1;

        let mut logs = self.logs.lock();
        if let Some(log) = logs.get_mut(topic) {
            tracing::warn!(topic, offset = log.cursor.offset(), "service failed to store PUBLISH");
            log.clear_waiting();
            self.schedule_retry(topic, log);
        }
    }

    /// Halt `topic` on a fatal error, otherwise retry later
    fn cursor_failed(&self, topic: &str, log: &mut LogState, error: &Error) {
        if error.is_fatal() {
            log.halted = true;
            tracing::error!(
                topic,
                offset = log.cursor.offset(),
                error = %error,
                "halting sync for topic"
            );
        } else {
            tracing::warn!(topic, error = %error, "cursor error, will retry");
            self.schedule_retry(topic, log);
        }
    }

    fn schedule_retry(&self, topic: &str, log: &mut LogState) {
        if !self.config.retry.allows(log.failures) {
            log.halted = true;
            tracing::error!(topic, failures = log.failures, "halting sync for topic after repeated failures");
            return;
        }
        log.failures += 1;
        let delay = self.config.retry.delay_for(log.failures);
        log.retry_at = Some(Instant::now() + delay);

        let waker = self.waker.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            waker.wake(&topic);
        });
    }

    fn check_outstanding_acks(&self) {
        let logs = self.logs.lock();
        for (topic, log) in logs.iter() {
            if let Some(since) = log.waiting_since {
                let elapsed = since.elapsed();
                if elapsed >= self.config.ack_warning {
                    tracing::warn!(
                        topic = %topic,
                        offset = log.cursor.offset(),
                        length = log.last_chunk,
                        "no reply to PUBLISH for {:?}",
                        elapsed
                    );
                }
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for (_, log) in self.logs.get_mut().drain() {
            log.tracker.remove_data_listener(log.listener);
            log.tracker.remove_consumer(&log.cursor);
        }
    }
}

/// Copy a segment region into memory
async fn read_region(region: &SegmentRegion) -> Result<SegmentChunk> {
    let mut file = tokio::fs::File::open(region.file.path()).await?;
    file.seek(SeekFrom::Start(region.position)).await?;
    let mut buf = vec![0u8; region.length as usize];
    file.read_exact(&mut buf).await?;
    Ok(SegmentChunk::new(Bytes::from(buf)))
}
