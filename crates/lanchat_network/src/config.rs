//! Network configuration for a chat node.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Configuration for the LAN chat networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port to accept peer connections on. Falls back to an ephemeral
    /// port when already bound; `0` always picks an ephemeral port.
    pub tcp_port: u16,

    /// Multicast group every instance joins.
    pub multicast_group: Ipv4Addr,

    /// UDP port of the multicast group.
    pub multicast_port: u16,

    /// Whether multicast discovery is enabled.
    pub discovery_enabled: bool,

    /// Interval between heartbeat announcements.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Interval between stale-peer sweeps.
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// A peer silent for longer than this is evicted.
    #[serde(with = "duration_serde")]
    pub peer_timeout: Duration,

    /// Timeout for establishing an outbound TCP connection.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// How long `stop()` waits for background loops to exit.
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,

    /// Number of message IDs remembered per TCP connection for dedup.
    pub dedup_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: 14000,
            multicast_group: Ipv4Addr::new(239, 255, 0, 1),
            multicast_port: 14001,
            discovery_enabled: true,
            heartbeat_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(2),
            dedup_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    /// A config suitable for tests: ephemeral ports, loopback-friendly.
    pub fn ephemeral() -> Self {
        Self {
            tcp_port: 0,
            multicast_port: 0,
            ..Self::default()
        }
    }

    /// Check the timing invariants the discovery engine relies on.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.heartbeat_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(NetworkError::Config(
                "heartbeat and sweep intervals must be non-zero".to_string(),
            ));
        }
        // Tolerate one or two dropped heartbeats before eviction.
        if self.peer_timeout < self.heartbeat_interval * 3 {
            return Err(NetworkError::Config(format!(
                "peer_timeout ({:?}) must be at least 3x heartbeat_interval ({:?})",
                self.peer_timeout, self.heartbeat_interval
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(NetworkError::Config(
                "dedup_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NetworkError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Like [`load_or_default`](Self::load_or_default), but a missing file
    /// is created with the defaults so the user has something to edit.
    pub fn load_or_init(path: &Path) -> Self {
        if path.exists() {
            return Self::load_or_default(path);
        }
        let config = Self::default();
        match config.save(path) {
            Ok(()) => tracing::info!("Wrote default network config to {}", path.display()),
            Err(e) => tracing::warn!("Cannot write default config to {}: {e}", path.display()),
        }
        config
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.tcp_port, 14000);
        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(config.multicast_port, 14001);
        assert!(config.discovery_enabled);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.peer_timeout, Duration::from_secs(15));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_cover_three_heartbeats() {
        let mut config = NetworkConfig::default();
        config.peer_timeout = Duration::from_secs(10);
        match config.validate() {
            Err(NetworkError::Config(msg)) => assert!(msg.contains("peer_timeout")),
            other => panic!("Expected Config error, got {other:?}"),
        }

        config.peer_timeout = Duration::from_secs(15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = NetworkConfig::default();
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"tcp_port": 15000, "peer_timeout": 30}"#).unwrap();
        assert_eq!(config.tcp_port, 15000);
        assert_eq!(config.peer_timeout, Duration::from_secs(30));
        assert_eq!(config.multicast_port, 14001);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("network.json");

        let mut original = NetworkConfig::default();
        original.tcp_port = 15500;
        original.discovery_enabled = false;
        original.save(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.tcp_port, 15500);
        assert!(!loaded.discovery_enabled);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.tcp_port, 14000);
    }

    #[test]
    fn test_config_init_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanchat").join("network.json");

        let config = NetworkConfig::load_or_init(&path);
        assert_eq!(config.tcp_port, 14000);
        assert!(path.exists());

        // An existing file is read, not overwritten.
        let mut edited = NetworkConfig::default();
        edited.tcp_port = 16000;
        edited.save(&path).unwrap();
        assert_eq!(NetworkConfig::load_or_init(&path).tcp_port, 16000);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig::load_or_default(&dir.path().join("absent.json"));
        assert_eq!(config.multicast_port, 14001);
    }
}
