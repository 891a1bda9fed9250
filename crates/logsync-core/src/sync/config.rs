//! Replication configuration

use crate::retry::RetryConfig;
use crate::sync::{ACK_WARNING_THRESHOLD, DEFAULT_PORT, MAX_CHUNK_SIZE, SERVICE_ROLL_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Replication configuration shared by client and service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Address the service listens on
    pub bind_addr: SocketAddr,

    /// Service address the client connects to (`host:port`)
    pub remote_addr: Option<String>,

    /// Name of the client's consumer cursors
    pub client_name: String,

    /// Largest PUBLISH payload
    pub chunk_size: u64,

    /// Age of an unacknowledged PUBLISH that gets logged
    pub ack_warning: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Roll size of segments written by the service
    pub service_roll_size: u64,

    /// Reconnect backoff, also the delay before re-sending after a FAILURE
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            remote_addr: None,
            client_name: "logsync".to_string(),
            chunk_size: MAX_CHUNK_SIZE,
            ack_warning: ACK_WARNING_THRESHOLD,
            connect_timeout: Duration::from_secs(10),
            service_roll_size: SERVICE_ROLL_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a service configuration
    pub fn service(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Create a client configuration
    pub fn client(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(remote_addr.into()),
            ..Default::default()
        }
    }

    /// Set the PUBLISH chunk size
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the service segment roll size
    pub fn with_service_roll_size(mut self, roll_size: u64) -> Self {
        self.service_roll_size = roll_size;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(format!("chunk_size must be between 1 and {}", MAX_CHUNK_SIZE));
        }
        if self.service_roll_size == 0 {
            return Err("service_roll_size must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be > 0".to_string());
        }
        if self.client_name.is_empty() {
            return Err("client_name must not be empty".to_string());
        }
        if let Some(remote) = &self.remote_addr {
            if remote.is_empty() {
                return Err("remote_addr must not be empty".to_string());
            }
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.chunk_size, 1 << 20);
        assert_eq!(config.service_roll_size, 32 << 20);
        assert_eq!(config.ack_warning, Duration::from_secs(300));
        assert!(config.remote_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_config() {
        let config = SyncConfig::client("storage-1:7620").with_chunk_size(4096);
        assert_eq!(config.remote_addr.as_deref(), Some("storage-1:7620"));
        assert_eq!(config.chunk_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_chunks() {
        let config = SyncConfig::default().with_chunk_size(MAX_CHUNK_SIZE + 1);
        assert!(config.validate().is_err());
        let config = SyncConfig::default().with_chunk_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"chunk_size": 65536, "client_name": "edge-7"}"#).unwrap();
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.client_name, "edge-7");
        assert_eq!(config.service_roll_size, SERVICE_ROLL_SIZE);
    }
}
