//! Relay client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_core::beacon::DISCOVERY_PORT;
use relay_core::client::BridgeConfig;
use relay_core::{DEFAULT_SERVICE_PORT, SERVICE_TYPE};

/// Top-level configuration for the relay client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub discovery: DiscoverySection,
    pub timeouts: TimeoutConfig,
    pub update: UpdateConfig,
    pub settings: SettingsSection,
    pub logging: LoggingConfig,
}

/// Which relay server to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Server address. Empty means: discover one.
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub port: u16,
    pub service_type: String,
    /// How long to listen for beacons before giving up.
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection test and device list budget.
    pub connect_ms: u64,
    /// Budget for one device's joints.
    pub joint_pull_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Interval between joint pulls in watch mode.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSection {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_SERVICE_PORT,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            service_type: SERVICE_TYPE.into(),
            wait_ms: 3000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5000,
            joint_pull_ms: 1000,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay-client.settings.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Apply a `host[:port]` override from the command line.
    pub fn set_server(&mut self, target: &str) {
        match target.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                self.server.address = host.to_string();
                self.server.port = port.parse().unwrap_or(self.server.port);
            }
            _ => self.server.address = target.to_string(),
        }
    }

    pub fn discovery_wait(&self) -> Duration {
        Duration::from_millis(self.discovery.wait_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update.interval_ms.max(1))
    }

    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            joint_pull_timeout: Duration::from_millis(self.timeouts.joint_pull_ms),
            local_server_port: None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_budgets() {
        let cfg = ClientConfig::default();
        let bridge = cfg.to_bridge_config();
        assert_eq!(bridge.connect_timeout, Duration::from_millis(5000));
        assert_eq!(bridge.joint_pull_timeout, Duration::from_millis(1000));
        assert!(cfg.server.address.is_empty());
    }

    #[test]
    fn server_override_parses_port() {
        let mut cfg = ClientConfig::default();
        cfg.set_server("192.168.1.20:12000");
        assert_eq!(cfg.server.address, "192.168.1.20");
        assert_eq!(cfg.server.port, 12000);

        cfg.set_server("relay.local");
        assert_eq!(cfg.server.address, "relay.local");
        assert_eq!(cfg.server.port, 12000);
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&ClientConfig::default()).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.discovery.port, DISCOVERY_PORT);
        assert_eq!(parsed.timeouts.joint_pull_ms, 1000);
    }
}
