//! Configuration for the relay server.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_core::beacon::DISCOVERY_PORT;
use relay_core::server::{DiscoveryConfig, SERVICE_TYPE, ServerConfig};
use relay_core::settings::SettingsStore;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoverySection,
    pub heartbeat: HeartbeatConfig,
    /// Optional client role running in the same process.
    pub client: ClientSection,
    pub demo: DemoConfig,
    pub settings: SettingsSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the RPC endpoint binds to.
    pub bind: IpAddr,
    /// RPC port. When unset, the `ServerPort` setting is used (10042 if
    /// that is unset too).
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Answer discovery probes.
    pub enabled: bool,
    pub port: u16,
    pub service_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats of in-demand devices.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

/// Simulated devices exposed when no real host is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSection {
    /// JSON file holding persisted relay state.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: None,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DISCOVERY_PORT,
            service_type: SERVICE_TYPE.into(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 100 }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1".into(),
            port: relay_core::DEFAULT_SERVICE_PORT,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            devices: vec!["SIMULATED-1".into()],
        }
    }
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay-server.settings.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl RelayServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms.max(1))
    }

    /// RPC port: the configured one, else the persisted setting.
    pub fn port(&self, settings: &dyn SettingsStore) -> u16 {
        self.network
            .port
            .unwrap_or_else(|| relay_core::server::configured_port(settings))
    }

    pub fn to_server_config(&self, settings: &dyn SettingsStore) -> ServerConfig {
        ServerConfig {
            bind: self.network.bind,
            port: self.port(settings),
            discovery: self.discovery.enabled.then(|| DiscoveryConfig {
                service_type: self.discovery.service_type.clone(),
                port: self.discovery.port,
            }),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::settings::{MemorySettings, SettingsExt, keys};

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&RelayServerConfig::default()).unwrap();
        assert!(text.contains("service_type"));
        assert!(text.contains("interval_ms"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: RelayServerConfig = toml::from_str("[network]\nport = 12000\n").unwrap();
        assert_eq!(cfg.network.port, Some(12000));
        assert_eq!(cfg.discovery.port, DISCOVERY_PORT);
        assert!(!cfg.client.enabled);
    }

    #[test]
    fn port_falls_back_to_settings() {
        let settings = MemorySettings::new();
        let cfg = RelayServerConfig::default();
        assert_eq!(cfg.port(&settings), 10042);

        settings.set(keys::SERVER_PORT, &11000u16).unwrap();
        assert_eq!(cfg.port(&settings), 11000);

        let server = cfg.to_server_config(&settings);
        assert_eq!(server.port, 11000);
        assert!(server.discovery.is_some());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RelayServerConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(cfg.logging.level, "info");
    }
}
