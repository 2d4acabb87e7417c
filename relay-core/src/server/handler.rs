//! Server-side answers to relay calls, backed by the host's devices.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::demand::{LOCAL_SESSION, SessionId, UpdateDemandSet};
use super::router::{self, PushRouter, PushStats};
use crate::error::Result;
use crate::host::{DeviceRegistry, HostBridge, RELAY_DEVICE_GUID, RELAYED_KEY_PREFIX, TrackingDevice, UpdateLock};
use crate::network::ConnectionSender;
use crate::protocol::calls::unix_millis;
use crate::protocol::{JointSnapshot, Push, RemoteDeviceSnapshot, ShutdownRequest};
use crate::service::RelayService;

/// `user@machine` for this process.
pub fn local_hostname() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let machine = gethostname::gethostname()
        .to_str()
        .unwrap_or("localhost")
        .to_string();
    format!("{user}@{machine}")
}

fn is_forwardable(guid: &str, device: &dyn TrackingDevice) -> bool {
    guid != RELAY_DEVICE_GUID && !guid.starts_with(RELAYED_KEY_PREFIX) && !device.is_relayed()
}

/// Shared state behind every server session.
pub struct RelayHandler {
    host: Arc<dyn HostBridge>,
    registry: Arc<dyn DeviceRegistry>,
    lock: UpdateLock,
    demand: Mutex<UpdateDemandSet>,
    router: Mutex<PushRouter>,
    hostname: String,
}

impl RelayHandler {
    pub fn new(host: Arc<dyn HostBridge>, registry: Arc<dyn DeviceRegistry>, lock: UpdateLock) -> Self {
        Self {
            host,
            registry,
            lock,
            demand: Mutex::new(UpdateDemandSet::new()),
            router: Mutex::new(PushRouter::new()),
            hostname: local_hostname(),
        }
    }

    /// Report `hostname` instead of the detected `user@machine`.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// The call surface as seen by one connected session.
    pub fn session(self: &Arc<Self>, id: SessionId, outbound: ConnectionSender) -> SessionService {
        SessionService {
            handler: self.clone(),
            session: id,
            outbound: Some(outbound),
        }
    }

    /// The call surface for in-process callers, which receive no pushes.
    pub fn local(self: &Arc<Self>) -> SessionService {
        SessionService {
            handler: self.clone(),
            session: LOCAL_SESSION,
            outbound: None,
        }
    }

    pub fn update_lock(&self) -> &UpdateLock {
        &self.lock
    }

    // ── Devices ──────────────────────────────────────────────────

    /// Devices this server may forward: everything except the relay's
    /// own device and devices that arrived through a relay.
    pub fn forwardable(&self) -> Vec<(String, Arc<dyn TrackingDevice>)> {
        self.registry
            .devices()
            .into_iter()
            .filter(|(guid, device)| is_forwardable(guid, device.as_ref()))
            .collect()
    }

    fn find(&self, guid: &str) -> Option<Arc<dyn TrackingDevice>> {
        self.registry
            .device(guid)
            .filter(|device| is_forwardable(guid, device.as_ref()))
    }

    async fn describe(&self, guid: &str, device: &dyn TrackingDevice) -> RemoteDeviceSnapshot {
        let mut snapshot = device.snapshot().await;
        snapshot.guid = guid.to_string();
        snapshot.name = self.host.device_name(guid).unwrap_or_else(|| guid.to_string());
        snapshot
    }

    // ── Demand & heartbeat ───────────────────────────────────────

    async fn mark_demand(&self, guid: &str, session: SessionId) {
        let _update = self.lock.lock().await;
        self.demand.lock().await.mark(guid, session);
    }

    /// Guids some session is polling.
    pub async fn demanded(&self) -> Vec<String> {
        self.demand.lock().await.guids()
    }

    /// Update every in-demand device that does not update itself.
    /// Returns how many devices were updated.
    pub async fn heartbeat(&self) -> usize {
        let _update = self.lock.lock().await;
        let guids = self.demand.lock().await.guids();

        let mut updated = 0;
        for guid in guids {
            let Some(device) = self.find(&guid) else {
                continue;
            };
            if device.is_self_updating() {
                continue;
            }
            device.update().await;
            updated += 1;
        }
        updated
    }

    /// Forget a closed session's pushes and demand.
    pub async fn release_session(&self, session: SessionId) {
        self.router.lock().await.unregister(session);
        let released = {
            let _update = self.lock.lock().await;
            self.demand.lock().await.release_session(session)
        };
        if !released.is_empty() {
            tracing::debug!(session, ?released, "devices no longer in demand");
        }
    }

    // ── Pushes ───────────────────────────────────────────────────

    async fn push(&self, push: Push) -> u64 {
        let targets = self.router.lock().await.targets();
        let (delivered, failed) = router::broadcast(push, targets).await;
        self.router.lock().await.record(delivered, &failed);
        delivered
    }

    /// Tell every client to shut down. Returns how many were told.
    pub async fn request_client_shutdown(&self, reason: &str, fatal: bool) -> u64 {
        self.push(Push::RequestShutdown(ShutdownRequest::new(reason, fatal))).await
    }

    /// Tell every client the device list changed.
    pub async fn request_reload(&self) -> u64 {
        self.push(Push::RefreshInterface).await
    }

    pub async fn push_stats(&self) -> PushStats {
        self.router.lock().await.stats().clone()
    }

    pub async fn push_route_count(&self) -> usize {
        self.router.lock().await.route_count()
    }
}

// ── SessionService ───────────────────────────────────────────────

/// [`RelayService`] bound to one session of a [`RelayHandler`].
#[derive(Clone)]
pub struct SessionService {
    handler: Arc<RelayHandler>,
    session: SessionId,
    outbound: Option<ConnectionSender>,
}

impl SessionService {
    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

#[async_trait]
impl RelayService for SessionService {
    async fn ping_service(&self) -> Result<i64> {
        if let Some(tx) = &self.outbound {
            let mut router = self.handler.router.lock().await;
            if !router.is_registered(self.session) {
                tracing::debug!(session = self.session, "session registered for pushes");
            }
            router.register(self.session, tx.clone());
        }
        Ok(unix_millis())
    }

    async fn request_shutdown(&self, reason: &str, fatal: bool) -> Result<bool> {
        tracing::info!(session = self.session, reason, fatal, "client requested shutdown");
        self.handler.host.request_exit(reason, fatal);
        Ok(true)
    }

    async fn get_remote_hostname(&self) -> Result<String> {
        Ok(self.handler.hostname.clone())
    }

    async fn list_tracking_devices(&self) -> Result<Vec<RemoteDeviceSnapshot>> {
        let mut out = Vec::new();
        for (guid, device) in self.handler.forwardable() {
            out.push(self.handler.describe(&guid, device.as_ref()).await);
        }
        Ok(out)
    }

    async fn get_tracking_device(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        Ok(match self.handler.find(guid) {
            Some(device) => Some(self.handler.describe(guid, device.as_ref()).await),
            None => None,
        })
    }

    async fn get_tracked_joints(&self, guid: &str) -> Result<Option<Vec<JointSnapshot>>> {
        self.handler.mark_demand(guid, self.session).await;
        Ok(match self.handler.find(guid) {
            Some(device) => Some(device.snapshot().await.joints),
            None => None,
        })
    }

    async fn device_initialize(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let Some(device) = self.handler.find(guid) else {
            return Ok(None);
        };
        {
            let _update = self.handler.lock.lock().await;
            device.initialize().await;
        }
        let snapshot = self.handler.describe(guid, device.as_ref()).await;
        self.handler
            .host
            .log(&format!("Initialized remote device {} ({}) for session {}", snapshot.name, guid, self.session));
        Ok(Some(snapshot))
    }

    async fn device_shutdown(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let Some(device) = self.handler.find(guid) else {
            return Ok(None);
        };
        {
            let _update = self.handler.lock.lock().await;
            device.shutdown().await;
        }
        let snapshot = self.handler.describe(guid, device.as_ref()).await;
        self.handler
            .host
            .log(&format!("Shut down remote device {} ({}) for session {}", snapshot.name, guid, self.session));
        Ok(Some(snapshot))
    }

    async fn device_signal_joint(&self, guid: &str, joint_id: i32) -> Result<Option<RemoteDeviceSnapshot>> {
        let Some(device) = self.handler.find(guid) else {
            return Ok(None);
        };
        device.signal_joint(joint_id).await;
        Ok(Some(self.handler.describe(guid, device.as_ref()).await))
    }
}
