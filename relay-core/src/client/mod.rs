//! Client role: a network proxy for [`RelayService`] plus the bridge that
//! mirrors a server's devices into the local host.

pub mod bridge;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{RelayError, Result};
use crate::frame::Frame;
use crate::message::{MessageType, Method};
use crate::network::{Connection, ConnectionInfo, ConnectionSender};
use crate::protocol::calls::{self, DeviceRequest, ShutdownRequest, SignalJointRequest};
use crate::protocol::{JointSnapshot, RemoteDeviceSnapshot};
use crate::service::{PushHandler, RelayService, deliver_push};
use crate::state::PendingCalls;

pub use bridge::{BridgeConfig, HostPushHandler, RelayBridge, RelayedDevice};

/// Budget for establishing a session and for interactive calls.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Budget for one per-device joint pull.
pub const JOINT_PULL_TIMEOUT: Duration = Duration::from_millis(1000);

/// One session to a relay server.
///
/// Calls may be issued concurrently from any task; replies are matched
/// by request id. When the connection drops every outstanding call fails
/// with [`RelayError::ChannelClosed`].
pub struct RelayClient {
    info: ConnectionInfo,
    tx: ConnectionSender,
    pending: Arc<Mutex<PendingCalls>>,
    closed: CancellationToken,
    call_timeout: Duration,
    guard: Mutex<Option<DropGuard>>,
    dispatcher: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to `info` within `timeout`. Pushes from the server go to
    /// `pushes` when given.
    pub async fn connect(
        info: &ConnectionInfo,
        timeout: Duration,
        pushes: Option<Arc<dyn PushHandler>>,
    ) -> Result<Self> {
        let conn = tokio::time::timeout(timeout, Connection::connect(info))
            .await
            .map_err(|_| RelayError::Timeout(timeout))??;

        let closed = conn.closed_token();
        let (tx, rx, guard) = conn.into_parts();
        let pending = Arc::new(Mutex::new(PendingCalls::new()));

        let dispatcher = tokio::spawn(dispatch_replies(rx, pending.clone(), pushes, closed.clone()));
        tracing::info!(peer = %info, "relay session established");

        Ok(Self {
            info: info.clone(),
            tx,
            pending,
            closed,
            call_timeout: timeout,
            guard: Mutex::new(Some(guard)),
            dispatcher,
        })
    }

    /// Use `timeout` for calls made through [`RelayService`].
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Cancelled once the session is gone.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.pending_count()).unwrap_or_default()
    }

    /// Issue one call and decode its reply, giving up after `timeout`.
    pub async fn call<T: DeserializeOwned>(&self, method: Method, payload: Vec<u8>, timeout: Duration) -> Result<T> {
        if self.closed.is_cancelled() {
            return Err(RelayError::ChannelClosed);
        }

        let (id, reply) = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| RelayError::Other("pending calls lock poisoned".into()))?;
            pending.expire(Instant::now());
            pending.track(method, timeout)
        };
        // the session may have dropped after the check above
        if self.closed.is_cancelled() {
            self.forget(id);
            return Err(RelayError::ChannelClosed);
        }

        let frame = match Frame::request(id, method, payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.forget(id);
                return Err(e);
            }
        };
        if self.tx.send(frame).await.is_err() {
            self.forget(id);
            return Err(RelayError::ChannelClosed);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Ok(frame))) => calls::decode(frame.payload()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => {
                self.forget(id);
                tracing::debug!(%method, request_id = id, ?timeout, "call timed out");
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    /// Joints of `guid`, bounded by `timeout` instead of the call timeout.
    pub async fn tracked_joints(&self, guid: &str, timeout: Duration) -> Result<Option<Vec<JointSnapshot>>> {
        self.call(Method::GetTrackedJoints, DeviceRequest::new(guid).to_bytes()?, timeout)
            .await
    }

    /// Say goodbye and tear the session down. Queued frames, including
    /// the goodbye, are flushed first.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.send(Frame::goodbye()).await;
        let guard = self.guard.lock().ok().and_then(|mut g| g.take());
        drop(guard);
        tracing::info!(peer = %self.info, "relay session closed");
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.cancel(id);
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_replies(
    mut rx: mpsc::Receiver<Frame>,
    pending: Arc<Mutex<PendingCalls>>,
    pushes: Option<Arc<dyn PushHandler>>,
    closed: CancellationToken,
) {
    while let Some(frame) = rx.recv().await {
        match frame.message_type() {
            MessageType::Response | MessageType::Fault => {
                let resolved = pending.lock().map(|mut p| p.resolve(frame)).unwrap_or(false);
                if !resolved {
                    tracing::trace!("reply for a call nobody waits on");
                }
            }
            MessageType::Push => {
                let Some(handler) = pushes.clone() else {
                    continue;
                };
                // handlers may call back into this session
                tokio::spawn(async move {
                    if let Err(e) = deliver_push(handler.as_ref(), &frame).await {
                        tracing::warn!(error = %e, "malformed push");
                    }
                });
            }
            MessageType::Request => {
                tracing::debug!(method = %frame.method(), "ignoring request from server");
            }
        }
    }

    closed.cancel();
    let failed = pending
        .lock()
        .map(|mut p| p.fail_all(|| RelayError::ChannelClosed))
        .unwrap_or_default();
    if failed > 0 {
        tracing::debug!(failed, "session dropped with calls in flight");
    }
}

#[async_trait]
impl RelayService for RelayClient {
    async fn ping_service(&self) -> Result<i64> {
        self.call(Method::PingService, Vec::new(), self.call_timeout).await
    }

    async fn request_shutdown(&self, reason: &str, fatal: bool) -> Result<bool> {
        let payload = ShutdownRequest::new(reason, fatal).to_bytes()?;
        self.call(Method::RequestShutdown, payload, self.call_timeout).await
    }

    async fn get_remote_hostname(&self) -> Result<String> {
        self.call(Method::GetRemoteHostname, Vec::new(), self.call_timeout).await
    }

    async fn list_tracking_devices(&self) -> Result<Vec<RemoteDeviceSnapshot>> {
        self.call(Method::ListTrackingDevices, Vec::new(), self.call_timeout).await
    }

    async fn get_tracking_device(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let payload = DeviceRequest::new(guid).to_bytes()?;
        self.call(Method::GetTrackingDevice, payload, self.call_timeout).await
    }

    async fn get_tracked_joints(&self, guid: &str) -> Result<Option<Vec<JointSnapshot>>> {
        self.tracked_joints(guid, self.call_timeout).await
    }

    async fn device_initialize(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let payload = DeviceRequest::new(guid).to_bytes()?;
        self.call(Method::DeviceInitialize, payload, self.call_timeout).await
    }

    async fn device_shutdown(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>> {
        let payload = DeviceRequest::new(guid).to_bytes()?;
        self.call(Method::DeviceShutdown, payload, self.call_timeout).await
    }

    async fn device_signal_joint(&self, guid: &str, joint_id: i32) -> Result<Option<RemoteDeviceSnapshot>> {
        let payload = SignalJointRequest::new(guid, joint_id).to_bytes()?;
        self.call(Method::DeviceSignalJoint, payload, self.call_timeout).await
    }
}
