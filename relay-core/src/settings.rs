//! Named-value settings store used to persist relay state between runs.
//!
//! The store itself is an opaque key/value interface; values are JSON so
//! that device snapshots and sets survive without a schema.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{RelayError, Result};

/// Setting names used by the relay.
pub mod keys {
    /// Last device list pulled from the relay server.
    pub const CACHED_REMOTE_DEVICES: &str = "CachedRemoteDevices";
    /// Last hostname reported by the relay server.
    pub const CACHED_RELAY_HOSTNAME: &str = "CachedRelayHostname";
    /// GUIDs hidden from the exposed device map.
    pub const DEVICES_BLACKLIST: &str = "DevicesBlacklist";
    /// Port the relay server listens on.
    pub const SERVER_PORT: &str = "ServerPort";
    /// Address the relay client connects to.
    pub const CLIENT_IP: &str = "ClientIP";
    /// Port the relay client connects to.
    pub const CLIENT_PORT: &str = "ClientPort";
}

pub trait SettingsStore: Send + Sync {
    fn get_value(&self, key: &str) -> Option<Value>;
    fn set_value(&self, key: &str, value: Value) -> Result<()>;
}

/// Typed access on top of any [`SettingsStore`].
pub trait SettingsExt {
    /// The stored value, or `default` when missing or of another shape.
    fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T;
    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()>;
}

impl<S: SettingsStore + ?Sized> SettingsExt for S {
    fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get_value(key) {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "ignoring malformed setting");
                default
            }),
            None => default,
        }
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set_value(key, serde_json::to_value(value)?)
    }
}

// ── MemorySettings ───────────────────────────────────────────────

/// Settings that live as long as the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .write()
            .map_err(|_| RelayError::Settings("settings lock poisoned".into()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}

// ── JsonFileSettings ─────────────────────────────────────────────

/// Settings persisted as one JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling, so a crash
/// mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileSettings {
    /// Load `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(RelayError::Settings(format!("{}: {e}", path.display()))),
        };
        tracing::debug!(path = %path.display(), count = values.len(), "loaded settings");
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| RelayError::Settings("settings lock poisoned".into()))?;
        values.insert(key.to_string(), value);
        self.flush(&values)
    }
}
