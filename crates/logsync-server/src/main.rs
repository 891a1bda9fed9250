//! logsync operator binary
//!
//! - `logsync serve` receives topics from sync clients
//! - `logsync sync` replicates local topics to a sync service
//! - `logsync check` compares topic checksums of two storage roots

mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use config::Config;
use logsync_core::{
    AsyncLogWriter, FileOffsetStore, LogStorage, SyncClient, SyncService, TrackerRegistry,
    topic_checksum,
};
use std::collections::HashSet;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// logsync command line
#[derive(Parser, Debug)]
#[command(name = "logsync")]
#[command(author, version, about = "Segment log storage and replication", long_about = None)]
struct Cli {
    /// Path to configuration file (default: ./logsync.toml if present)
    #[arg(long, short = 'c', env = "LOGSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store topics published by sync clients
    Serve {
        /// Listen address (overrides the configuration)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Replicate every local topic to a sync service
    Sync {
        /// Service address (overrides the configuration)
        #[arg(long)]
        remote: Option<String>,

        /// Append each stdin line as an entry of this topic
        #[arg(long)]
        stdin_topic: Option<String>,
    },
    /// Compare per-topic checksums of two storage roots
    Check {
        /// First storage root
        left: PathBuf,
        /// Second storage root
        right: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let mut config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.sync.bind_addr = bind;
            }
            serve(&config).await
        }
        Command::Sync {
            remote,
            stdin_topic,
        } => {
            if remote.is_some() {
                config.sync.remote_addr = remote;
            }
            sync(&config, stdin_topic).await
        }
        Command::Check { left, right } => check(&left, &right),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "logsync=debug,logsync_core=debug"
    } else {
        "logsync=info,logsync_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn serve(config: &Config) -> Result<()> {
    let registry = Arc::new(TrackerRegistry::new(LogStorage::new(&config.data_dir)));
    let service = Arc::new(SyncService::with_registry(config.sync_config()?, registry.clone()));
    let addr = service.start().await?;
    info!("Storing topics under {} (listening on {})", config.data_dir.display(), addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.stop();

    for tracker in registry.trackers() {
        if let Err(e) = tracker.sync() {
            warn!(topic = tracker.topic(), "Failed to sync segment: {}", e);
        }
    }
    Ok(())
}

async fn sync(config: &Config, stdin_topic: Option<String>) -> Result<()> {
    let sync_config = config.sync_config()?;
    if sync_config.remote_addr.is_none() {
        bail!("no remote address: set [sync] remote_addr, LOGSYNC_REMOTE_ADDR or --remote");
    }

    let registry = Arc::new(TrackerRegistry::new(LogStorage::new(&config.data_dir)));
    let offsets = Arc::new(FileOffsetStore::new(&config.offsets_dir));
    let client = Arc::new(SyncClient::new(sync_config));
    client.add_offset_store(offsets.clone());

    let mut topics = registry.topic_ids()?;
    if let Some(topic) = &stdin_topic {
        topics.insert(topic.clone());
    }
    for topic in &topics {
        register_topic(&client, &registry, &offsets, topic)?;
    }
    info!("Replicating {} topics from {}", topics.len(), config.data_dir.display());

    if let Some(topic) = stdin_topic {
        let writer = AsyncLogWriter::new(registry.clone(), config.writer_config()?)?;
        std::thread::Builder::new()
            .name("logsync-stdin".to_string())
            .spawn(move || ingest_stdin(writer, topic))
            .context("failed to spawn stdin reader")?;
    }

    let mut task = {
        let client = client.clone();
        tokio::spawn(async move { client.start().await })
    };

    let cleanup_enabled = config.cleanup_interval().is_some();
    let mut ticker =
        tokio::time::interval(config.cleanup_interval().unwrap_or(Duration::from_secs(3600)));
    ticker.tick().await;
    let mut cleaned = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            result = &mut task => {
                // the client only returns on its own once retries are exhausted
                result??;
                return Ok(());
            }
            _ = ticker.tick(), if cleanup_enabled => {
                cleanup(&registry, &client, &offsets, config.retain(), &mut cleaned);
            }
        }
    }

    client.stop();
    task.await??;
    Ok(())
}

fn register_topic(
    client: &SyncClient,
    registry: &TrackerRegistry,
    offsets: &FileOffsetStore,
    topic: &str,
) -> Result<()> {
    let tracker = registry.get(topic)?;
    let stored = offsets.load(topic)?;
    if let Some(offset) = stored {
        tracker.resume_at(offset)?;
    }

    let first = tracker
        .files()
        .first()
        .map(|f| f.offset())
        .unwrap_or_else(|| tracker.max_offset());
    let max = tracker.max_offset();

    let start = stored.unwrap_or(first).clamp(first, max);
    if stored.is_some_and(|offset| offset != start) {
        warn!(topic, stored = ?stored, start, "stored offset outside the local log");
    }

    client.register(&tracker, start)?;
    info!(topic, start, max_offset = max, "registered topic");
    Ok(())
}

fn ingest_stdin(writer: AsyncLogWriter, topic: String) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        if let Err(e) = writer.append(topic.as_str(), line.into_bytes()) {
            error!(topic = %topic, "Failed to append entry: {}", e);
            break;
        }
    }
    if let Err(e) = writer.flush() {
        error!(topic = %topic, "Failed to flush entries: {}", e);
    }
    info!(topic = %topic, "stdin closed");
}

/// Delete segments that are old enough and acknowledged by the service
///
/// `cleaned` holds the topics without segments after the previous pass;
/// returns the topics that became empty in this one.
fn cleanup(
    registry: &TrackerRegistry,
    client: &SyncClient,
    offsets: &FileOffsetStore,
    retain: Duration,
    cleaned: &mut HashSet<String>,
) -> Vec<String> {
    let mut emptied = Vec::new();
    for topic in client.topics() {
        let Some(tracker) = registry.peek(&topic) else {
            continue;
        };
        let caught_up = client
            .progress(&topic)
            .is_some_and(|p| !p.halted && !p.waiting && p.offset == p.max_offset);

        let result = match offsets.load(&topic) {
            Ok(Some(acked)) if caught_up => tracker.cleanup_all_files(retain, acked),
            Ok(_) => tracker.cleanup_files(retain),
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => {
                if cleaned.insert(topic.clone()) {
                    info!(topic = %topic, "topic fully cleaned up");
                    emptied.push(topic);
                }
            }
            Ok(false) => {
                cleaned.remove(&topic);
            }
            Err(e) => warn!(topic = %topic, "Cleanup failed: {}", e),
        }
    }
    emptied
}

fn check(left: &Path, right: &Path) -> Result<()> {
    let left = TrackerRegistry::new(LogStorage::new(left));
    let right = TrackerRegistry::new(LogStorage::new(right));
    let left_topics = left.topic_ids()?;
    let right_topics = right.topic_ids()?;

    let mut mismatched = 0;
    for topic in left_topics.union(&right_topics) {
        if !left_topics.contains(topic) || !right_topics.contains(topic) {
            println!("{}: present on one side only", topic);
            mismatched += 1;
            continue;
        }

        let a = topic_checksum(&left.get(topic)?).with_context(|| format!("{}: left", topic))?;
        let b = topic_checksum(&right.get(topic)?).with_context(|| format!("{}: right", topic))?;
        if a == b {
            println!("{}: ok {} entries, {} bytes, sha512 {}", topic, a.entries, a.bytes, &a.digest[..16]);
        } else {
            println!(
                "{}: MISMATCH left {} entries sha512 {} / right {} entries sha512 {}",
                topic,
                a.entries,
                &a.digest[..16],
                b.entries,
                &b.digest[..16]
            );
            mismatched += 1;
        }
    }

    if mismatched > 0 {
        bail!("{} topics differ", mismatched);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use logsync_core::SyncConfig;
    use tempfile::TempDir;

    #[test]
    fn test_cleanup_reports_emptied_topic_once() {
        let dir = TempDir::new().unwrap();
        let registry = TrackerRegistry::new(LogStorage::new(dir.path().join("data")));
        let offsets = FileOffsetStore::new(dir.path().join("offsets"));
        let client = SyncClient::new(SyncConfig::client("127.0.0.1:1"));
        let tracker = registry.get("t").unwrap();
        client.register(&tracker, 0).unwrap();

        let mut cleaned = HashSet::new();
        let first = cleanup(&registry, &client, &offsets, Duration::ZERO, &mut cleaned);
        assert_eq!(first, vec!["t".to_string()]);
        let second = cleanup(&registry, &client, &offsets, Duration::ZERO, &mut cleaned);
        assert!(second.is_empty());

        // data arriving again clears the mark
        tracker.append(b"abc", 1024).unwrap();
        assert!(cleanup(&registry, &client, &offsets, Duration::ZERO, &mut cleaned).is_empty());
        assert!(cleaned.is_empty());
    }
}
