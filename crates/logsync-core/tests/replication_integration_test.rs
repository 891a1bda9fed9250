//! Replication integration tests
//!
//! Drives a real SyncService and SyncClient over loopback TCP:
//! - byte-identical mirroring across writer flushes and segment rolls
//! - resynchronization when the service is behind the client
//! - PUBNAK/FAILURE retries
//! - resuming from a durably stored offset after a restart

use logsync_core::sync::service::{PublishHandler, PublishOutcome, TrackerStoreHandler};
use logsync_core::{
    FileOffsetStore, LogStorage, LogWriter, OffsetStore, RetryConfig, SegmentChunk, SyncClient,
    SyncConfig, SyncService, TopicLogTracker, TrackerRegistry, WriterConfig, topic_checksum,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn registry(root: &Path) -> Arc<TrackerRegistry> {
    Arc::new(TrackerRegistry::new(LogStorage::new(root)))
}

fn client_config(addr: SocketAddr) -> SyncConfig {
    SyncConfig::client(addr.to_string())
        .with_chunk_size(300)
        .with_retry(RetryConfig::fixed(Duration::from_millis(20)))
}

fn service_config(roll_size: u64) -> SyncConfig {
    SyncConfig::service(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).with_service_roll_size(roll_size)
}

/// Concatenated bytes of every segment of `tracker`
fn log_bytes(tracker: &TopicLogTracker) -> Vec<u8> {
    let mut bytes = Vec::new();
    for file in tracker.files() {
        bytes.extend(std::fs::read(file.path()).unwrap());
    }
    bytes
}

fn write_entries(writer: &mut LogWriter, topic: &str, rng: &mut StdRng, count: usize) {
    for i in 0..count {
        let len = rng.gen_range(0..400);
        let entry: Vec<u8> = (0..len).map(|_| rng.r#gen::<u8>()).collect();
        writer.add(topic, &entry).unwrap();
        if i % 7 == 0 {
            writer.flush_topic(topic).unwrap();
        }
    }
    writer.flush().unwrap();
}

fn spawn_client(client: &Arc<SyncClient>) -> tokio::task::JoinHandle<logsync_core::Result<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.start().await })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replication_fidelity() {
    let dir = TempDir::new().unwrap();
    let local = registry(&dir.path().join("client"));
    let remote = registry(&dir.path().join("service"));

    let mut writer = LogWriter::new(local.clone(), WriterConfig::default().with_roll_size(2048));
    let mut rng = StdRng::seed_from_u64(7);
    write_entries(&mut writer, "orders", &mut rng, 200);
    write_entries(&mut writer, "audit", &mut rng, 50);
    assert!(local.get("orders").unwrap().files().len() > 2);

    let service = Arc::new(SyncService::with_registry(service_config(4096), remote.clone()));
    let addr = service.start().await.unwrap();

    let client = Arc::new(SyncClient::new(client_config(addr)));
    for topic in ["orders", "audit"] {
        client.register(&local.get(topic).unwrap(), 0).unwrap();
    }
    let task = spawn_client(&client);

    wait_for("initial catch-up", || client.is_caught_up()).await;

    // more data while connected, split across rolls
    write_entries(&mut writer, "orders", &mut rng, 100);
    wait_for("follow-up catch-up", || {
        client.is_caught_up()
            && remote.get("orders").unwrap().max_offset() == local.get("orders").unwrap().max_offset()
    })
    .await;

    for topic in ["orders", "audit"] {
        let mine = local.get(topic).unwrap();
        let theirs = remote.get(topic).unwrap();
        assert_eq!(theirs.max_offset(), mine.max_offset(), "{}", topic);
        assert_eq!(log_bytes(&theirs), log_bytes(&mine), "{}", topic);
        assert_eq!(topic_checksum(&theirs).unwrap(), topic_checksum(&mine).unwrap(), "{}", topic);
    }

    let stats = client.stats();
    assert_eq!(stats.acks, stats.publishes);
    assert_eq!(stats.resets, 0);
    assert_eq!(service.stats().bytes_received, stats.bytes_published);

    client.stop();
    task.await.unwrap().unwrap();
    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resync_when_service_is_behind() {
    let dir = TempDir::new().unwrap();
    let local = registry(&dir.path().join("client"));
    let remote = registry(&dir.path().join("service"));

    let mine = local.get("t").unwrap();
    let data: Vec<u8> = (0..200u32).map(|i| (i * 31 % 251) as u8).collect();
    mine.append(&data, 1024).unwrap();
    // the service only has the first 100 bytes
    remote.get("t").unwrap().append(&data[..100], 1024).unwrap();

    let service = Arc::new(SyncService::with_registry(service_config(1024), remote.clone()));
    let addr = service.start().await.unwrap();

    let stored = Arc::new(Mutex::new(Vec::new()));
    let sink = stored.clone();
    let client = Arc::new(SyncClient::new(client_config(addr)));
    client.add_offset_store(Arc::new(move |_: &str, offset: u64| -> logsync_core::Result<()> {
        sink.lock().push(offset);
        Ok(())
    }));
    // the client believes the service already holds 150 bytes
    let cursor = client.register(&mine, 150).unwrap();
    let task = spawn_client(&client);

    wait_for("catch-up after reset", || client.is_caught_up()).await;

    assert_eq!(client.stats().resets, 1);
    // the reset offset is recorded before anything else is acknowledged
    assert_eq!(stored.lock().first(), Some(&100));
    assert_eq!(*stored.lock().last().unwrap(), 200);
    assert_eq!(cursor.offset(), 200);
    assert_eq!(log_bytes(&remote.get("t").unwrap()), data);

    client.stop();
    task.await.unwrap().unwrap();
    service.stop();
}

#[tokio::test]
async fn test_cursor_lands_on_reset_offset() {
    let dir = TempDir::new().unwrap();
    let tracker = TopicLogTracker::open("t", dir.path().join("t")).unwrap();
    tracker.append(&[5u8; 200], 1024).unwrap();

    let cursor = tracker.new_consumer("sync", 150).unwrap();
    cursor.set_offset(100).unwrap();
    assert_eq!(cursor.offset(), 100);
    assert_eq!(cursor.block_offset(), 100);
    assert_eq!(cursor.block_available(), 100);
}

/// Fails the first `remaining` publishes, then stores
struct Flaky {
    remaining: AtomicU32,
    inner: TrackerStoreHandler,
}

impl PublishHandler for Flaky {
    fn publish(&self, topic: &str, offset: u64, chunk: &SegmentChunk) -> PublishOutcome {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return PublishOutcome::Failed("disk unavailable".to_string());
        }
        self.inner.publish(topic, offset, chunk)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let local = registry(&dir.path().join("client"));
    let remote = registry(&dir.path().join("service"));
    let mine = local.get("t").unwrap();
    mine.append(&[3u8; 1000], 4096).unwrap();

    let service = Arc::new(SyncService::new(service_config(4096)));
    service.add_handler(Arc::new(Flaky {
        remaining: AtomicU32::new(2),
        inner: TrackerStoreHandler::new(remote.clone(), 4096),
    }));
    let addr = service.start().await.unwrap();

    let client = Arc::new(SyncClient::new(client_config(addr)));
    client.register(&mine, 0).unwrap();
    let task = spawn_client(&client);

    wait_for("catch-up after failures", || client.is_caught_up()).await;
    assert_eq!(client.stats().failures, 2);
    assert_eq!(service.stats().failures, 2);
    assert_eq!(log_bytes(&remote.get("t").unwrap()), log_bytes(&mine));

    client.stop();
    task.await.unwrap().unwrap();
    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_from_stored_offset() {
    let dir = TempDir::new().unwrap();
    let local = registry(&dir.path().join("client"));
    let remote = registry(&dir.path().join("service"));
    let offsets = Arc::new(FileOffsetStore::new(dir.path().join("offsets")));

    let service = Arc::new(SyncService::with_registry(service_config(1024), remote.clone()));
    let addr = service.start().await.unwrap();

    let mine = local.get("t").unwrap();
    mine.append(&[1u8; 900], 512).unwrap();

    {
        let client = Arc::new(SyncClient::new(client_config(addr)));
        client.add_offset_store(offsets.clone());
        client.register(&mine, 0).unwrap();
        let task = spawn_client(&client);
        wait_for("first session", || client.is_caught_up()).await;
        client.stop();
        task.await.unwrap().unwrap();
    }
    assert_eq!(offsets.load("t").unwrap(), Some(900));
    assert_eq!(mine.consumer_count(), 0);

    mine.append(&[2u8; 700], 512).unwrap();
    assert_eq!(mine.files().len(), 2);

    let client = Arc::new(SyncClient::new(client_config(addr)));
    client.add_offset_store(offsets.clone());
    let start = offsets.load("t").unwrap().unwrap_or(0);
    client.register(&mine, start).unwrap();
    let task = spawn_client(&client);
    wait_for("second session", || client.is_caught_up()).await;

    assert_eq!(client.stats().resets, 0);
    assert_eq!(offsets.load("t").unwrap(), Some(1600));
    assert_eq!(log_bytes(&remote.get("t").unwrap()), log_bytes(&mine));

    // the replicated prefix can now be cleaned up locally
    client.stop();
    task.await.unwrap().unwrap();
    drop(client);
    assert!(mine.cleanup_all_files(Duration::ZERO, 1600).unwrap());
    assert!(mine.files().is_empty());
    assert_eq!(mine.max_offset(), 1600);

    service.stop();
}

#[test]
fn test_roll_and_multi_segment_read() {
    let dir = TempDir::new().unwrap();
    let tracker = TopicLogTracker::open("t", dir.path().join("t")).unwrap();
    for _ in 0..10 {
        tracker.append(&[0xAB; 300], 1024).unwrap();
    }

    let starts: Vec<u64> = tracker.files().iter().map(|f| f.offset()).collect();
    assert_eq!(starts, vec![0, 1200, 2400]);

    let cursor = tracker.new_consumer("reader", 0).unwrap();
    while cursor.has_more().unwrap() {
        let available = cursor.block_available();
        cursor.consume(available).unwrap();
    }
    assert_eq!(cursor.offset(), 3000);
}

#[test]
fn test_offset_store_closure_and_file_agree() {
    let dir = TempDir::new().unwrap();
    let file = FileOffsetStore::new(dir.path());
    let stores: Vec<Box<dyn OffsetStore>> = vec![
        Box::new(file.clone()),
        Box::new(|_: &str, _: u64| -> logsync_core::Result<()> { Ok(()) }),
    ];
    for store in &stores {
        store.store("t", 42).unwrap();
    }
    assert_eq!(file.load("t").unwrap(), Some(42));
}
