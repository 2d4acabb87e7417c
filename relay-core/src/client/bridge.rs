//! Mirrors a relay server's devices into the local host.
//!
//! The bridge owns the session, the status machine in
//! [`RelayStatus`](crate::state::RelayStatus) and the device cache. Every
//! remote call is bounded by a timeout and can be cancelled; a failed call
//! never surfaces as an error past the bridge, it moves the status
//! instead.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CONNECT_TIMEOUT, JOINT_PULL_TIMEOUT, RelayClient};
use crate::cache::DeviceSnapshotCache;
use crate::error::{RelayError, Result};
use crate::host::{HostBridge, RELAY_DEVICE_GUID, RELAYED_KEY_PREFIX, TrackingDevice, UpdateLock};
use crate::network::ConnectionInfo;
use crate::protocol::{PLACEHOLDER_STATUS, RemoteDeviceSnapshot, StatusText};
use crate::server::detect_backfeed;
use crate::service::{PushHandler, RelayService};
use crate::settings::{SettingsExt, SettingsStore, keys};
use crate::state::RelayStatus;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub connect_timeout: Duration,
    pub joint_pull_timeout: Duration,
    /// Port of a relay server running in this process, if any.
    pub local_server_port: Option<u16>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            joint_pull_timeout: JOINT_PULL_TIMEOUT,
            local_server_port: None,
        }
    }
}

#[derive(Default)]
struct BridgeState {
    status: RelayStatus,
    cause: Option<String>,
    client: Option<Arc<RelayClient>>,
    hostname: Option<String>,
    hostname_cached: bool,
    ping_ms: Option<u64>,
}

pub struct RelayBridge {
    host: Arc<dyn HostBridge>,
    settings: Arc<dyn SettingsStore>,
    lock: UpdateLock,
    cache: DeviceSnapshotCache,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl RelayBridge {
    pub fn new(
        host: Arc<dyn HostBridge>,
        settings: Arc<dyn SettingsStore>,
        lock: UpdateLock,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let cached: String = settings.get_or(keys::CACHED_RELAY_HOSTNAME, String::new());
        let state = BridgeState {
            hostname_cached: !cached.is_empty(),
            hostname: (!cached.is_empty()).then_some(cached),
            ..BridgeState::default()
        };
        Arc::new(Self {
            host,
            settings,
            lock,
            cache: DeviceSnapshotCache::new(),
            config,
            state: Mutex::new(state),
        })
    }

    pub fn cache(&self) -> &DeviceSnapshotCache {
        &self.cache
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // ── Status ───────────────────────────────────────────────────

    pub fn status(&self) -> RelayStatus {
        self.read(|s| s.status)
    }

    /// Three-part status with the last failure as description.
    pub fn status_text(&self) -> StatusText {
        self.read(|s| s.status.describe(s.cause.as_deref()))
    }

    /// Remote `user@machine`, suffixed with `(Cached)` while it comes
    /// from settings rather than a live session.
    pub fn hostname(&self) -> Option<String> {
        self.read(|s| match (&s.hostname, s.hostname_cached) {
            (Some(name), true) => Some(format!("{name} (Cached)")),
            (Some(name), false) => Some(name.clone()),
            (None, _) => None,
        })
    }

    /// Round trip of the last successful connection test.
    pub fn ping_ms(&self) -> Option<u64> {
        self.read(|s| s.ping_ms)
    }

    pub fn is_connected(&self) -> bool {
        self.client().is_some_and(|c| c.is_connected())
    }

    /// The relay's own device, carrying the bridge status.
    pub fn relay_snapshot(&self) -> RemoteDeviceSnapshot {
        let mut snapshot = RemoteDeviceSnapshot::new(RELAY_DEVICE_GUID, "Tracking Relay");
        let status = self.status();
        snapshot.status_code = status.code();
        snapshot.status_text = self.status_text().to_string();
        snapshot.initialized = status.is_live();
        snapshot
    }

    fn read<T>(&self, f: impl FnOnce(&BridgeState) -> T) -> T {
        match self.state.lock() {
            Ok(state) => f(&state),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write(&self, f: impl FnOnce(&mut BridgeState)) {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn client(&self) -> Option<Arc<RelayClient>> {
        self.read(|s| s.client.clone())
    }

    fn set_status(&self, status: RelayStatus, cause: Option<String>) -> RelayStatus {
        self.write(|s| {
            if s.status != status {
                tracing::info!(from = %s.status, to = %status, cause = cause.as_deref().unwrap_or(""), "relay status changed");
            }
            s.status = status;
            s.cause = cause;
        });
        status
    }

    fn fail(&self, error: &RelayError) -> RelayStatus {
        let next = self.status().after_failure(error);
        tracing::warn!(error = %error, status = %next, "relay call failed");
        let status = self.set_status(next, Some(error.to_string()));
        self.host.refresh_interface();
        status
    }

    // ── Session ──────────────────────────────────────────────────

    /// Connect to `target`, test the connection and pull the device list.
    pub async fn initialize(&self, target: ConnectionInfo, cancel: &CancellationToken) -> RelayStatus {
        if let Some(port) = self.config.local_server_port {
            if detect_backfeed(port, &target) {
                tracing::warn!(%target, "refusing to relay into this process's own server");
                let status = self.set_status(RelayStatus::BackFeedDetected, None);
                self.host.refresh_interface();
                return status;
            }
        }

        self.close_session().await;

        if target.ip().trim().is_empty() || target.port() == 0 {
            let status = self.set_status(RelayStatus::ServiceError, Some(format!("invalid relay address {target}")));
            self.host.refresh_interface();
            return status;
        }

        self.set_status(RelayStatus::NotInitialized, None);
        let pushes: Arc<dyn PushHandler> = Arc::new(HostPushHandler::new(self.host.clone()));
        let connect = RelayClient::connect(&target, self.config.connect_timeout, Some(pushes));
        let client = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = connect => result,
        };
        let client = match client {
            Ok(client) => Arc::new(client),
            Err(e) => return self.fail(&e),
        };
        self.write(|s| s.client = Some(client.clone()));

        match self.test_connection(&client, cancel).await {
            Ok(()) => self.refresh(cancel).await,
            Err(e) => self.fail(&e),
        }
    }

    async fn test_connection(&self, client: &RelayClient, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            pong = client.ping_service() => { pong?; }
        }
        let ping_ms = started.elapsed().as_millis() as u64;

        let hostname = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            name = client.get_remote_hostname() => name?,
        };
        if let Err(e) = self.settings.set(keys::CACHED_RELAY_HOSTNAME, &hostname) {
            tracing::warn!(error = %e, "could not persist relay hostname");
        }
        tracing::info!(%hostname, ping_ms, "relay server answered");
        self.write(|s| {
            s.ping_ms = Some(ping_ms);
            s.hostname = Some(hostname);
            s.hostname_cached = false;
        });
        Ok(())
    }

    /// Pull the device list and every device's joints.
    ///
    /// An empty list leaves the cache as it was.
    pub async fn refresh(&self, cancel: &CancellationToken) -> RelayStatus {
        let Some(client) = self.client() else {
            return self.status();
        };
        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            pulled = self.pull_devices(&client) => pulled,
        };

        let devices = match pulled {
            Ok(devices) => devices,
            Err(e) => return self.fail(&e),
        };
        if devices.is_empty() {
            let status = self.set_status(RelayStatus::DevicesListEmpty, None);
            self.host.refresh_interface();
            return status;
        }

        {
            let _update = self.lock.lock().await;
            self.cache.replace_all(devices).await;
        }
        self.persist_devices().await;

        let status = self.set_status(RelayStatus::Success, None);
        self.host.reload_devices();
        self.host.refresh_interface();
        status
    }

    async fn pull_devices(&self, client: &RelayClient) -> Result<Vec<RemoteDeviceSnapshot>> {
        let listed = tokio::time::timeout(self.config.connect_timeout, client.list_tracking_devices())
            .await
            .map_err(|_| RelayError::Timeout(self.config.connect_timeout))??;

        let mut devices = Vec::with_capacity(listed.len());
        for mut device in listed {
            match client.tracked_joints(&device.guid, self.config.joint_pull_timeout).await? {
                Some(joints) => {
                    device.skeleton_tracked = !joints.is_empty();
                    device.joints = joints;
                }
                None => {
                    device.skeleton_tracked = false;
                    device.joints.clear();
                }
            }
            devices.push(device);
        }
        Ok(devices)
    }

    async fn persist_devices(&self) {
        let snapshots = self.cache.snapshots().await;
        if let Err(e) = self.settings.set(keys::CACHED_REMOTE_DEVICES, &snapshots) {
            tracing::warn!(error = %e, "could not persist relay devices");
        }
    }

    /// Send goodbye and forget the session.
    pub async fn disconnect(&self) {
        self.close_session().await;
        self.set_status(RelayStatus::Disconnected, None);
        self.host.refresh_interface();
    }

    async fn close_session(&self) {
        let client = match self.state.lock() {
            Ok(mut state) => state.client.take(),
            Err(poisoned) => poisoned.into_inner().client.take(),
        };
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Ask the server's host to exit.
    pub async fn request_server_shutdown(&self, reason: &str, fatal: bool) -> Result<bool> {
        let client = self.client().ok_or(RelayError::ChannelClosed)?;
        client.request_shutdown(reason, fatal).await.inspect_err(|e| {
            self.fail(e);
        })
    }

    // ── Devices ──────────────────────────────────────────────────

    /// Pull one device's joints and merge them into the cache.
    pub async fn update_device(&self, guid: &str) -> Result<()> {
        let client = self.client().ok_or(RelayError::ChannelClosed)?;
        let joints = match client.tracked_joints(guid, self.config.joint_pull_timeout).await {
            Ok(joints) => joints,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let _update = self.lock.lock().await;
        match joints {
            Some(joints) => {
                self.cache.merge_joints(guid, joints).await;
            }
            None => {
                self.cache.mark_untracked(guid).await;
            }
        }
        Ok(())
    }

    pub async fn device_initialize(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let client = self.client().ok_or(RelayError::ChannelClosed)?;
        let snapshot = client.device_initialize(guid).await.inspect_err(|e| {
            self.fail(e);
        })?;
        self.apply(snapshot.clone()).await;
        Ok(snapshot)
    }

    pub async fn device_shutdown(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let client = self.client().ok_or(RelayError::ChannelClosed)?;
        let snapshot = client.device_shutdown(guid).await.inspect_err(|e| {
            self.fail(e);
        })?;
        self.apply(snapshot.clone()).await;
        Ok(snapshot)
    }

    pub async fn device_signal_joint(&self, guid: &str, joint_id: i32) -> Result<Option<RemoteDeviceSnapshot>> {
        let client = self.client().ok_or(RelayError::ChannelClosed)?;
        client.device_signal_joint(guid, joint_id).await.inspect_err(|e| {
            self.fail(e);
        })
    }

    async fn apply(&self, snapshot: Option<RemoteDeviceSnapshot>) {
        if let Some(snapshot) = snapshot {
            let _update = self.lock.lock().await;
            self.cache.update_snapshot(snapshot).await;
        }
    }

    /// Last known state of one device, live or cached.
    pub async fn snapshot(&self, guid: &str) -> Option<RemoteDeviceSnapshot> {
        if let Some(device) = self.cache.device(guid).await {
            return Some(device.snapshot);
        }
        self.persisted_devices().into_iter().find(|d| d.guid == guid)
    }

    fn persisted_devices(&self) -> Vec<RemoteDeviceSnapshot> {
        self.settings
            .get_or(keys::CACHED_REMOTE_DEVICES, Vec::<RemoteDeviceSnapshot>::new())
            .into_iter()
            .map(|mut d| {
                d.status_text = PLACEHOLDER_STATUS.to_string();
                d.initialized = false;
                d
            })
            .collect()
    }

    /// Devices the host should show, keyed `TRACKINGRELAY:<guid>`.
    ///
    /// Live data while the status is `Success`, the persisted list
    /// otherwise. Blacklisted devices are left out.
    pub async fn exposed_devices(&self) -> Vec<(String, RemoteDeviceSnapshot)> {
        let devices = if self.status().is_live() {
            self.cache.snapshots().await
        } else {
            self.persisted_devices()
        };
        let blacklist = self.blacklist();
        devices
            .into_iter()
            .filter(|d| !blacklist.contains(&d.guid))
            .map(|d| (format!("{RELAYED_KEY_PREFIX}{}", d.guid), d))
            .collect()
    }

    /// Proxies for [`exposed_devices`](Self::exposed_devices), ready to
    /// register with the host as `(key, name, device)`.
    pub async fn relayed_devices(self: &Arc<Self>) -> Vec<(String, String, Arc<dyn TrackingDevice>)> {
        self.exposed_devices()
            .await
            .into_iter()
            .map(|(key, d)| {
                let device: Arc<dyn TrackingDevice> = Arc::new(RelayedDevice {
                    bridge: self.clone(),
                    guid: d.guid,
                });
                (key, d.name, device)
            })
            .collect()
    }

    pub fn blacklist(&self) -> BTreeSet<String> {
        self.settings.get_or(keys::DEVICES_BLACKLIST, BTreeSet::new())
    }

    pub fn is_device_enabled(&self, guid: &str) -> bool {
        !self.blacklist().contains(guid)
    }

    /// Show or hide a device in the exposed map.
    pub fn set_device_enabled(&self, guid: &str, enabled: bool) -> Result<()> {
        let mut blacklist = self.blacklist();
        let changed = if enabled {
            blacklist.remove(guid)
        } else {
            blacklist.insert(guid.to_string())
        };
        if changed {
            self.settings.set(keys::DEVICES_BLACKLIST, &blacklist)?;
            self.host.reload_devices();
        }
        Ok(())
    }
}

// ── RelayedDevice ────────────────────────────────────────────────

/// Host-side stand-in for one device living on the relay server.
pub struct RelayedDevice {
    bridge: Arc<RelayBridge>,
    guid: String,
}

impl RelayedDevice {
    pub fn guid(&self) -> &str {
        &self.guid
    }
}

#[async_trait]
impl TrackingDevice for RelayedDevice {
    async fn snapshot(&self) -> RemoteDeviceSnapshot {
        self.bridge.snapshot(&self.guid).await.unwrap_or_else(|| {
            let mut snapshot = RemoteDeviceSnapshot::new(self.guid.clone(), self.guid.clone());
            snapshot.status_text = PLACEHOLDER_STATUS.to_string();
            snapshot
        })
    }

    async fn initialize(&self) {
        if let Err(e) = self.bridge.device_initialize(&self.guid).await {
            tracing::debug!(guid = %self.guid, error = %e, "relayed initialize failed");
        }
    }

    async fn shutdown(&self) {
        if let Err(e) = self.bridge.device_shutdown(&self.guid).await {
            tracing::debug!(guid = %self.guid, error = %e, "relayed shutdown failed");
        }
    }

    async fn signal_joint(&self, joint_id: i32) {
        if let Err(e) = self.bridge.device_signal_joint(&self.guid, joint_id).await {
            tracing::debug!(guid = %self.guid, error = %e, "relayed signal failed");
        }
    }

    async fn update(&self) {
        if !self.bridge.status().is_live() {
            return;
        }
        if let Err(e) = self.bridge.update_device(&self.guid).await {
            tracing::debug!(guid = %self.guid, error = %e, "relayed update failed");
        }
    }

    fn is_relayed(&self) -> bool {
        true
    }
}

// ── HostPushHandler ──────────────────────────────────────────────

/// Forwards server pushes to the local host.
pub struct HostPushHandler {
    host: Arc<dyn HostBridge>,
}

impl HostPushHandler {
    pub fn new(host: Arc<dyn HostBridge>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl PushHandler for HostPushHandler {
    async fn on_request_shutdown(&self, reason: &str, fatal: bool) {
        self.host.log(&format!("Relay server requested shutdown: {reason}"));
        self.host.request_exit(reason, fatal);
    }

    async fn on_refresh_interface(&self) {
        self.host.refresh_interface();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::host::{HostEvent, MemoryHost, update_lock};
    use crate::message::{MessageType, Method};
    use crate::network::Connection;
    use crate::protocol::JointSnapshot;
    use crate::protocol::calls;
    use crate::settings::MemorySettings;

    /// A server with one device that answers the session calls and
    /// faults everything else, as a server rejecting its arguments does.
    async fn faulting_server() -> ConnectionInfo {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream).unwrap();
            while let Some(frame) = conn.recv().await {
                if frame.message_type() != MessageType::Request || frame.method().is_session() {
                    continue;
                }
                let (id, method) = (frame.request_id(), frame.method());
                let payload = match method {
                    Method::PingService => calls::encode(&0i64),
                    Method::GetRemoteHostname => calls::encode(&"me@box".to_string()),
                    Method::ListTrackingDevices => calls::encode(&vec![RemoteDeviceSnapshot::new("A", "Alpha")]),
                    Method::GetTrackedJoints => calls::encode(&Some(Vec::<JointSnapshot>::new())),
                    _ => Err(RelayError::Other("bad arguments".into())),
                };
                let reply = match payload {
                    Ok(payload) => Frame::response(id, method, payload).unwrap(),
                    Err(e) => Frame::fault(id, method, &e.to_string()).unwrap(),
                };
                if conn.send(reply).await.is_err() {
                    break;
                }
            }
        });
        ConnectionInfo::new("127.0.0.1", port)
    }

    fn bridge(config: BridgeConfig) -> (Arc<MemoryHost>, Arc<MemorySettings>, Arc<RelayBridge>) {
        let host = Arc::new(MemoryHost::new());
        let settings = Arc::new(MemorySettings::new());
        let bridge = RelayBridge::new(host.clone(), settings.clone(), update_lock(), config);
        (host, settings, bridge)
    }

    #[tokio::test]
    async fn backfeed_refuses_to_connect() {
        let (host, _, bridge) = bridge(BridgeConfig {
            local_server_port: Some(10042),
            ..BridgeConfig::default()
        });
        let status = bridge
            .initialize(ConnectionInfo::new("127.0.0.1", 10042), &CancellationToken::new())
            .await;
        assert_eq!(status, RelayStatus::BackFeedDetected);
        assert!(!bridge.is_connected());
        assert_eq!(host.history(), vec![HostEvent::RefreshInterface]);
    }

    #[tokio::test]
    async fn bad_address_is_service_error() {
        let (_, _, bridge) = bridge(BridgeConfig::default());
        let status = bridge
            .initialize(ConnectionInfo::new("", 10042), &CancellationToken::new())
            .await;
        assert_eq!(status, RelayStatus::ServiceError);
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_, _, bridge) = bridge(BridgeConfig::default());
        let status = bridge
            .initialize(ConnectionInfo::new("127.0.0.1", port), &CancellationToken::new())
            .await;
        assert_eq!(status, RelayStatus::ConnectionError);
        assert!(bridge.status_text().description.contains("connection"));
    }

    #[tokio::test]
    async fn remote_fault_is_other_and_keeps_session() {
        let target = faulting_server().await;
        let (_, _, bridge) = bridge(BridgeConfig::default());
        assert_eq!(
            bridge.initialize(target, &CancellationToken::new()).await,
            RelayStatus::Success
        );

        let err = bridge.device_initialize("A").await.unwrap_err();
        assert!(matches!(err, RelayError::Remote { .. }));
        assert_eq!(bridge.status(), RelayStatus::Other);
        assert!(bridge.status_text().description.contains("bad arguments"));
        assert!(bridge.is_connected());
    }

    #[tokio::test]
    async fn cached_hostname_is_marked() {
        let host = Arc::new(MemoryHost::new());
        let settings = Arc::new(MemorySettings::new());
        settings.set(keys::CACHED_RELAY_HOSTNAME, "me@box").unwrap();
        let bridge = RelayBridge::new(host, settings, update_lock(), BridgeConfig::default());
        assert_eq!(bridge.hostname().as_deref(), Some("me@box (Cached)"));
    }

    #[tokio::test]
    async fn exposed_devices_fall_back_to_settings() {
        let (host, settings, bridge) = bridge(BridgeConfig::default());
        let cached = vec![RemoteDeviceSnapshot::new("A", "Alpha"), RemoteDeviceSnapshot::new("B", "Beta")];
        settings.set(keys::CACHED_REMOTE_DEVICES, &cached).unwrap();

        let exposed = bridge.exposed_devices().await;
        assert_eq!(exposed.len(), 2);
        assert_eq!(exposed[0].0, "TRACKINGRELAY:A");
        assert_eq!(exposed[0].1.status_text, PLACEHOLDER_STATUS);

        bridge.set_device_enabled("A", false).unwrap();
        assert!(!bridge.is_device_enabled("A"));
        let exposed = bridge.exposed_devices().await;
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed[0].0, "TRACKINGRELAY:B");
        assert!(host.history().contains(&HostEvent::ReloadDevices));

        let proxies = bridge.relayed_devices().await;
        assert!(proxies[0].2.is_relayed());
        assert_eq!(proxies[0].2.snapshot().await.name, "Beta");
    }

    #[tokio::test]
    async fn relay_snapshot_reports_status() {
        let (_, _, bridge) = bridge(BridgeConfig::default());
        let snap = bridge.relay_snapshot();
        assert_eq!(snap.guid, RELAY_DEVICE_GUID);
        assert_eq!(snap.status_code, RelayStatus::NotInitialized.code());
        assert_eq!(snap.status().code, "E_NOT_INITIALIZED");
    }

    #[tokio::test]
    async fn push_handler_reaches_host() {
        let host = Arc::new(MemoryHost::new());
        let handler = HostPushHandler::new(host.clone());
        handler.on_refresh_interface().await;
        handler.on_request_shutdown("maintenance", true).await;
        assert_eq!(
            host.history(),
            vec![
                HostEvent::RefreshInterface,
                HostEvent::RequestExit { reason: "maintenance".into(), fatal: true }
            ]
        );
    }
}
