//! The narrow interface between the relay and the application hosting it.
//!
//! The relay never reaches into the host directly. It asks a
//! [`HostBridge`] to reload or redraw, reads devices through a
//! [`DeviceRegistry`], and serializes device mutation through the host's
//! [`UpdateLock`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::{
    CapabilityFlags, JointRole, JointSnapshot, Quat, RemoteDeviceSnapshot, TrackingState, Vec3,
};

/// Identity of the relay's own device in the host registry.
pub const RELAY_DEVICE_GUID: &str = "RELAY-DEVICE-TRACKINGRELAY";

/// Prefix of registry keys for devices forwarded by a relay.
pub const RELAYED_KEY_PREFIX: &str = "TRACKINGRELAY:";

/// One coarse lock standing for "the host's update cycle".
///
/// Anything that mutates shared device or joint state, or schedules
/// device updates, holds it for the duration.
pub type UpdateLock = Arc<tokio::sync::Mutex<()>>;

pub fn update_lock() -> UpdateLock {
    Arc::new(tokio::sync::Mutex::new(()))
}

// ── Traits ───────────────────────────────────────────────────────

/// Capabilities the relay calls on its host.
pub trait HostBridge: Send + Sync {
    /// The set of relayed devices changed; rebuild the device list.
    fn reload_devices(&self);
    /// Status text changed; redraw whatever shows it.
    fn refresh_interface(&self);
    /// Display name the host uses for `guid`, if it knows one.
    fn device_name(&self, guid: &str) -> Option<String>;
    /// Ask the host application to exit.
    fn request_exit(&self, reason: &str, fatal: bool);
    /// Route a message into the host's log.
    fn log(&self, message: &str) {
        tracing::info!(target: "relay::host", "{message}");
    }
}

/// A tracking device as the host drives it.
#[async_trait]
pub trait TrackingDevice: Send + Sync {
    /// Current state as a plain value.
    async fn snapshot(&self) -> RemoteDeviceSnapshot;
    async fn initialize(&self);
    async fn shutdown(&self);
    async fn signal_joint(&self, joint_id: i32);
    /// Pull fresh joint data. Called by heartbeats for devices that do
    /// not update themselves.
    async fn update(&self);
    /// `true` when the device refreshes itself and heartbeats skip it.
    fn is_self_updating(&self) -> bool {
        false
    }
    /// `true` for devices that are themselves forwarded by a relay.
    fn is_relayed(&self) -> bool {
        false
    }
}

/// The host's table of devices.
pub trait DeviceRegistry: Send + Sync {
    /// Every device the host knows about, keyed by guid. Returns a
    /// snapshot, so callers need no lock to iterate it.
    fn devices(&self) -> Vec<(String, Arc<dyn TrackingDevice>)>;

    fn device(&self, guid: &str) -> Option<Arc<dyn TrackingDevice>> {
        self.devices()
            .into_iter()
            .find_map(|(g, d)| (g == guid).then_some(d))
    }
}

// ── MemoryHost ───────────────────────────────────────────────────

/// Something a [`MemoryHost`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    ReloadDevices,
    RefreshInterface,
    RequestExit { reason: String, fatal: bool },
}

/// A self-contained host: a device table plus an event feed.
///
/// Used by the binaries when no real host application is attached, and
/// by tests to observe what the relay asks of its host.
pub struct MemoryHost {
    devices: RwLock<BTreeMap<String, Arc<dyn TrackingDevice>>>,
    names: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<HostEvent>,
    history: Mutex<Vec<HostEvent>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: RwLock::new(BTreeMap::new()),
            names: RwLock::new(BTreeMap::new()),
            events,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn add_device(&self, guid: impl Into<String>, name: impl Into<String>, device: Arc<dyn TrackingDevice>) {
        let guid = guid.into();
        if let Ok(mut names) = self.names.write() {
            names.insert(guid.clone(), name.into());
        }
        if let Ok(mut devices) = self.devices.write() {
            devices.insert(guid, device);
        }
    }

    pub fn remove_device(&self, guid: &str) -> Option<Arc<dyn TrackingDevice>> {
        if let Ok(mut names) = self.names.write() {
            names.remove(guid);
        }
        self.devices.write().ok()?.remove(guid)
    }

    /// Drop every relayed device and add `devices` in their place.
    pub fn replace_relayed(&self, devices: Vec<(String, String, Arc<dyn TrackingDevice>)>) {
        let stale: Vec<String> = self
            .devices()
            .into_iter()
            .filter(|(_, d)| d.is_relayed())
            .map(|(g, _)| g)
            .collect();
        for guid in stale {
            self.remove_device(&guid);
        }
        for (guid, name, device) in devices {
            self.add_device(guid, name, device);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Every event so far, oldest first.
    pub fn history(&self) -> Vec<HostEvent> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn emit(&self, event: HostEvent) {
        if let Ok(mut history) = self.history.lock() {
            history.push(event.clone());
        }
        let _ = self.events.send(event);
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBridge for MemoryHost {
    fn reload_devices(&self) {
        self.emit(HostEvent::ReloadDevices);
    }

    fn refresh_interface(&self) {
        self.emit(HostEvent::RefreshInterface);
    }

    fn device_name(&self, guid: &str) -> Option<String> {
        self.names.read().ok()?.get(guid).cloned()
    }

    fn request_exit(&self, reason: &str, fatal: bool) {
        tracing::warn!(reason, fatal, "host exit requested");
        self.emit(HostEvent::RequestExit {
            reason: reason.to_string(),
            fatal,
        });
    }
}

impl DeviceRegistry for MemoryHost {
    fn devices(&self) -> Vec<(String, Arc<dyn TrackingDevice>)> {
        self.devices
            .read()
            .map(|d| d.iter().map(|(g, d)| (g.clone(), d.clone())).collect())
            .unwrap_or_default()
    }
}

// ── SimulatedDevice ──────────────────────────────────────────────

/// A device that produces a slowly moving skeleton on every update.
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<SimulatedState>,
    self_updating: bool,
}

#[derive(Debug)]
struct SimulatedState {
    snapshot: RemoteDeviceSnapshot,
    updates: u64,
    signals: Vec<i32>,
}

impl SimulatedDevice {
    pub fn new(guid: impl Into<String>, name: impl Into<String>, roles: &[JointRole]) -> Self {
        let mut snapshot = RemoteDeviceSnapshot::new(guid, name);
        snapshot.status_text = "Success!\nS_OK\nSimulated device is running.".into();
        snapshot.capabilities = CapabilityFlags::FLIP_SUPPORTED | CapabilityFlags::APP_ORIENTATION_SUPPORTED;
        snapshot.joints = roles
            .iter()
            .map(|role| JointSnapshot::new(format!("{role:?}"), *role))
            .collect();
        Self {
            state: Mutex::new(SimulatedState {
                snapshot,
                updates: 0,
                signals: Vec::new(),
            }),
            self_updating: false,
        }
    }

    /// Mark the device as refreshing itself, so heartbeats leave it alone.
    pub fn self_updating(mut self) -> Self {
        self.self_updating = true;
        self
    }

    pub fn update_count(&self) -> u64 {
        self.state.lock().map(|s| s.updates).unwrap_or_default()
    }

    pub fn signals(&self) -> Vec<i32> {
        self.state.lock().map(|s| s.signals.clone()).unwrap_or_default()
    }

    pub fn set_joints(&self, joints: Vec<JointSnapshot>) {
        if let Ok(mut state) = self.state.lock() {
            state.snapshot.joints = joints;
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut SimulatedState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }
}

#[async_trait]
impl TrackingDevice for SimulatedDevice {
    async fn snapshot(&self) -> RemoteDeviceSnapshot {
        self.state
            .lock()
            .map(|s| s.snapshot.clone())
            .unwrap_or_default()
    }

    async fn initialize(&self) {
        self.with_state(|s| {
            s.snapshot.initialized = true;
            s.snapshot.skeleton_tracked = true;
        });
    }

    async fn shutdown(&self) {
        self.with_state(|s| {
            s.snapshot.initialized = false;
            s.snapshot.skeleton_tracked = false;
        });
    }

    async fn signal_joint(&self, joint_id: i32) {
        self.with_state(|s| s.signals.push(joint_id));
    }

    async fn update(&self) {
        self.with_state(|s| {
            s.updates += 1;
            let t = s.updates as f32 * 0.01;
            for (i, joint) in s.snapshot.joints.iter_mut().enumerate() {
                joint.position = Vec3::new(t.sin(), 1.0 + i as f32 * 0.1, t.cos());
                joint.orientation = Quat::IDENTITY;
                joint.tracking_state = TrackingState::Tracked;
            }
        });
    }

    fn is_self_updating(&self) -> bool {
        self.self_updating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_device_lifecycle() {
        let dev = SimulatedDevice::new("SIM-1", "Sim", &[JointRole::Head, JointRole::SpineWaist]);
        assert!(!dev.snapshot().await.initialized);

        dev.initialize().await;
        dev.update().await;
        dev.signal_joint(3).await;

        let snap = dev.snapshot().await;
        assert!(snap.initialized);
        assert_eq!(snap.joints.len(), 2);
        assert_eq!(snap.joints[0].tracking_state, TrackingState::Tracked);
        assert_eq!(dev.update_count(), 1);
        assert_eq!(dev.signals(), vec![3]);

        dev.shutdown().await;
        assert!(!dev.snapshot().await.initialized);
    }

    #[tokio::test]
    async fn memory_host_records_events() {
        let host = MemoryHost::new();
        let mut rx = host.subscribe();
        host.reload_devices();
        host.request_exit("bye", false);

        assert_eq!(rx.recv().await.unwrap(), HostEvent::ReloadDevices);
        assert_eq!(
            host.history(),
            vec![
                HostEvent::ReloadDevices,
                HostEvent::RequestExit { reason: "bye".into(), fatal: false }
            ]
        );
    }

    #[test]
    fn registry_lookup() {
        let host = MemoryHost::new();
        host.add_device("SIM-1", "Sim One", Arc::new(SimulatedDevice::new("SIM-1", "Sim", &[])));
        assert!(host.device("SIM-1").is_some());
        assert!(host.device("SIM-2").is_none());
        assert_eq!(host.device_name("SIM-1").as_deref(), Some("Sim One"));

        host.remove_device("SIM-1");
        assert!(host.devices().is_empty());
    }
}
