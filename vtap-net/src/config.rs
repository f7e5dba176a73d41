//! Tap device configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smoltcp::wire::EthernetAddress;

use crate::backend::BackendKind;
use crate::error::ConfigError;
use crate::housekeeping::{DEFAULT_CONNECTION_GRACE, DEFAULT_HOUSEKEEPING_INTERVAL};
use crate::wire::NetworkId;

/// Default interface MTU
pub const DEFAULT_MTU: u32 = 2800;

/// Runtime tunables, loadable from a JSON file.
///
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapSettings {
    pub housekeeping_interval_ms: u64,
    pub connection_grace_ms: u64,
    /// Upper bound on how long the background thread sleeps between loops
    pub max_idle_wait_ms: u64,
    pub tcp_buffer_size: usize,
    pub udp_buffer_size: usize,
    pub udp_packet_slots: usize,
    /// Cap on pre-allocated sockets per listener
    pub max_listen_backlog: usize,
}

impl Default for TapSettings {
    fn default() -> Self {
        Self {
            housekeeping_interval_ms: DEFAULT_HOUSEKEEPING_INTERVAL.as_millis() as u64,
            connection_grace_ms: DEFAULT_CONNECTION_GRACE.as_millis() as u64,
            max_idle_wait_ms: 10,
            tcp_buffer_size: 64 * 1024,
            udp_buffer_size: 64 * 1024,
            udp_packet_slots: 32,
            max_listen_backlog: 16,
        }
    }
}

impl TapSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn connection_grace(&self) -> Duration {
        Duration::from_millis(self.connection_grace_ms)
    }

    pub fn max_idle_wait(&self) -> Duration {
        Duration::from_millis(self.max_idle_wait_ms)
    }
}

/// Everything needed to bring up one tap device.
#[derive(Debug, Clone)]
pub struct TapConfig {
    pub storage_path: PathBuf,
    pub mac: EthernetAddress,
    pub mtu: u32,
    pub metric: u32,
    pub network_id: NetworkId,
    pub backend: BackendKind,
    pub settings: TapSettings,
}

impl TapConfig {
    pub fn new(storage_path: impl Into<PathBuf>, mac: EthernetAddress, network_id: NetworkId) -> Self {
        Self {
            storage_path: storage_path.into(),
            mac,
            mtu: DEFAULT_MTU,
            metric: 0,
            network_id,
            backend: BackendKind::default(),
            settings: TapSettings::default(),
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_settings(mut self, settings: TapSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = TapSettings::default();
        assert_eq!(settings.housekeeping_interval(), Duration::from_secs(10));
        assert_eq!(settings.connection_grace(), Duration::from_secs(30));

        let config = TapConfig::new("/tmp/x", EthernetAddress([2, 0, 0, 0, 0, 1]), NetworkId(5));
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.backend, BackendKind::Smoltcp);
    }

    #[test]
    fn test_builder() {
        let config = TapConfig::new("/tmp/x", EthernetAddress([2, 0, 0, 0, 0, 1]), NetworkId(5))
            .with_mtu(1400)
            .with_metric(3)
            .with_backend(BackendKind::None);
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.metric, 3);
        assert_eq!(config.backend, BackendKind::None);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"connection_grace_ms": 500, "udp_packet_slots": 4}}"#).unwrap();

        let settings = TapSettings::load(file.path()).unwrap();
        assert_eq!(settings.connection_grace(), Duration::from_millis(500));
        assert_eq!(settings.udp_packet_slots, 4);
        assert_eq!(settings.max_idle_wait_ms, 10);
        assert_eq!(settings.max_listen_backlog, 16);
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            TapSettings::load("/nonexistent/vtap.json"),
            Err(ConfigError::Io(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(TapSettings::load(file.path()), Err(ConfigError::Parse(_))));
    }
}
