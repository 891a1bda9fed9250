//! Operator configuration
//!
//! Loaded from `logsync.toml` (or `--config`), then overridden by
//! `LOGSYNC_DATA_DIR`, `LOGSYNC_REMOTE_ADDR` and `LOGSYNC_BIND_ADDR`.
//! Durations are plain integers with a unit suffix in the key name so the
//! file stays readable.

use anyhow::{Context, Result};
use logsync_core::sync::{DEFAULT_PORT, MAX_CHUNK_SIZE, SERVICE_ROLL_SIZE};
use logsync_core::writer::DEFAULT_ROLL_SIZE;
use logsync_core::{RetryConfig, SyncConfig, WriterConfig};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "logsync.toml";

/// Operator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage root holding one directory per topic
    pub data_dir: PathBuf,
    /// Directory of acknowledged offsets (must not be inside `data_dir`)
    pub offsets_dir: PathBuf,
    /// Replication settings
    pub sync: SyncSection,
    /// Block writer settings
    pub writer: WriterSection,
    /// Retention settings
    pub retention: RetentionSection,
}

/// `[sync]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub bind_addr: SocketAddr,
    pub remote_addr: Option<String>,
    pub client_name: String,
    pub chunk_size: u64,
    pub connect_timeout_ms: u64,
    pub ack_warning_secs: u64,
    pub service_roll_size: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// 0 retries forever
    pub retry_max_attempts: u32,
}

/// `[writer]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterSection {
    pub roll_size: u64,
    pub compression_level: i32,
    pub max_buffer_bytes: usize,
    pub flush_interval_ms: u64,
}

/// `[retention]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub retain_secs: u64,
    /// 0 disables cleanup
    pub cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            offsets_dir: PathBuf::from("./offsets"),
            sync: SyncSection::default(),
            writer: WriterSection::default(),
            retention: RetentionSection::default(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            remote_addr: None,
            client_name: "logsync".to_string(),
            chunk_size: MAX_CHUNK_SIZE,
            connect_timeout_ms: 10_000,
            ack_warning_secs: 300,
            service_roll_size: SERVICE_ROLL_SIZE,
            retry_initial_ms: retry.initial_delay.as_millis() as u64,
            retry_max_ms: retry.max_delay.as_millis() as u64,
            retry_max_attempts: retry.max_attempts,
        }
    }
}

impl Default for WriterSection {
    fn default() -> Self {
        let writer = WriterConfig::default();
        Self {
            roll_size: DEFAULT_ROLL_SIZE,
            compression_level: writer.compression_level,
            max_buffer_bytes: writer.max_buffer_bytes,
            flush_interval_ms: writer.flush_interval.as_millis() as u64,
        }
    }
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            retain_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load `path`, or `logsync.toml` if present, then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Override settings from environment variables
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var("LOGSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(remote) = var("LOGSYNC_REMOTE_ADDR") {
            self.sync.remote_addr = Some(remote);
        }
        if let Some(bind) = var("LOGSYNC_BIND_ADDR") {
            self.sync.bind_addr = bind
                .parse()
                .with_context(|| format!("invalid LOGSYNC_BIND_ADDR {:?}", bind))?;
        }
        Ok(())
    }

    /// Replication configuration for the core library
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let section = &self.sync;
        let config = SyncConfig {
            bind_addr: section.bind_addr,
            remote_addr: section.remote_addr.clone(),
            client_name: section.client_name.clone(),
            chunk_size: section.chunk_size,
            ack_warning: Duration::from_secs(section.ack_warning_secs),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            service_roll_size: section.service_roll_size,
            retry: RetryConfig {
                max_attempts: section.retry_max_attempts,
                initial_delay: Duration::from_millis(section.retry_initial_ms),
                max_delay: Duration::from_millis(section.retry_max_ms),
                ..RetryConfig::default()
            },
        };
        config.validate().map_err(anyhow::Error::msg).context("invalid [sync] section")?;
        Ok(config)
    }

    /// Block writer configuration for the core library
    pub fn writer_config(&self) -> Result<WriterConfig> {
        let section = &self.writer;
        let config = WriterConfig {
            roll_size: section.roll_size,
            compression_level: section.compression_level,
            max_buffer_bytes: section.max_buffer_bytes,
            flush_interval: Duration::from_millis(section.flush_interval_ms),
            ..WriterConfig::default()
        };
        config.validate().map_err(anyhow::Error::msg).context("invalid [writer] section")?;
        Ok(config)
    }

    /// Minimum age of a segment before cleanup may delete it
    pub fn retain(&self) -> Duration {
        Duration::from_secs(self.retention.retain_secs)
    }

    /// Period of the cleanup pass, `None` when disabled
    pub fn cleanup_interval(&self) -> Option<Duration> {
        match self.retention.cleanup_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        let sync = config.sync_config().unwrap();
        assert_eq!(sync.chunk_size, 1 << 20);
        assert_eq!(sync.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.writer_config().unwrap().roll_size, 32 << 10);
        assert_eq!(config.cleanup_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logsync.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/logsync"

[sync]
remote_addr = "storage-1:7620"
chunk_size = 65536

[retention]
cleanup_interval_secs = 0
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/logsync"));
        assert_eq!(config.sync.remote_addr.as_deref(), Some("storage-1:7620"));
        assert_eq!(config.sync_config().unwrap().chunk_size, 65536);
        assert_eq!(config.writer.roll_size, DEFAULT_ROLL_SIZE);
        assert_eq!(config.cleanup_interval(), None);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LOGSYNC_DATA_DIR", "/tmp/topics"),
            ("LOGSYNC_BIND_ADDR", "127.0.0.1:9000"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/topics"));
        assert_eq!(config.sync.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert!(config.sync.remote_addr.is_none());

        let mut config = Config::default();
        assert!(config
            .apply_env(|key| (key == "LOGSYNC_BIND_ADDR").then(|| "nowhere".to_string()))
            .is_err());
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut config = Config::default();
        config.sync.chunk_size = 0;
        assert!(config.sync_config().is_err());

        let mut config = Config::default();
        config.writer.compression_level = 40;
        assert!(config.writer_config().is_err());
    }
}
