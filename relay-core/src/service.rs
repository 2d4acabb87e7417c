//! The relay's RPC surface.
//!
//! [`RelayService`] is implemented twice: by the server, which answers
//! from the host's devices, and by the client, which forwards every call
//! over a session. [`dispatch`] turns a request frame into a call on any
//! implementation and the call's result back into a reply frame.

use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::frame::Frame;
use crate::message::{MessageType, Method};
use crate::protocol::calls::{self, DeviceRequest, Push, ShutdownRequest, SignalJointRequest};
use crate::protocol::{JointSnapshot, RemoteDeviceSnapshot};

/// Calls a client can make on a relay server.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Liveness probe; returns the server's clock in Unix milliseconds.
    async fn ping_service(&self) -> Result<i64>;
    /// Ask the server's host to exit.
    async fn request_shutdown(&self, reason: &str, fatal: bool) -> Result<bool>;
    /// `user@machine` identity of the server process.
    async fn get_remote_hostname(&self) -> Result<String>;
    /// Every forwardable device on the server.
    async fn list_tracking_devices(&self) -> Result<Vec<RemoteDeviceSnapshot>>;
    async fn get_tracking_device(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>>;
    /// Joints of one device; also marks the device as in demand.
    async fn get_tracked_joints(&self, guid: &str) -> Result<Option<Vec<JointSnapshot>>>;
    async fn device_initialize(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>>;
    async fn device_shutdown(&self, guid: &str) -> Result<Option<RemoteDeviceSnapshot>>;
    async fn device_signal_joint(&self, guid: &str, joint_id: i32) -> Result<Option<RemoteDeviceSnapshot>>;
}

/// Receives server-initiated notifications on the client side.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn on_request_shutdown(&self, reason: &str, fatal: bool);
    async fn on_refresh_interface(&self);
}

/// Answer one request frame with `service`.
///
/// Returns `None` for frames that take no reply: session housekeeping,
/// pushes and stray replies.
pub async fn dispatch<S: RelayService + ?Sized>(service: &S, frame: &Frame) -> Option<Frame> {
    if frame.message_type() != MessageType::Request || frame.method().is_session() {
        return None;
    }

    let method = frame.method();
    let id = frame.request_id();
    let reply = match serve(service, method, frame.payload()).await {
        Ok(payload) => Frame::response(id, method, payload),
        Err(e) => {
            tracing::debug!(%method, request_id = id, error = %e, "call failed");
            Frame::fault(id, method, &e.to_string())
        }
    };

    match reply {
        Ok(frame) => Some(frame),
        Err(e) => Frame::fault(id, method, &e.to_string()).ok(),
    }
}

async fn serve<S: RelayService + ?Sized>(service: &S, method: Method, payload: &[u8]) -> Result<Vec<u8>> {
    match method {
        Method::PingService => calls::encode(&service.ping_service().await?),
        Method::RequestShutdown => {
            let req = ShutdownRequest::from_bytes(payload)?;
            calls::encode(&service.request_shutdown(&req.reason, req.fatal).await?)
        }
        Method::GetRemoteHostname => calls::encode(&service.get_remote_hostname().await?),
        Method::ListTrackingDevices => calls::encode(&service.list_tracking_devices().await?),
        Method::GetTrackingDevice => {
            let req = DeviceRequest::from_bytes(payload)?;
            calls::encode(&service.get_tracking_device(&req.guid).await?)
        }
        Method::GetTrackedJoints => {
            let req = DeviceRequest::from_bytes(payload)?;
            calls::encode(&service.get_tracked_joints(&req.guid).await?)
        }
        Method::DeviceInitialize => {
            let req = DeviceRequest::from_bytes(payload)?;
            calls::encode(&service.device_initialize(&req.guid).await?)
        }
        Method::DeviceShutdown => {
            let req = DeviceRequest::from_bytes(payload)?;
            calls::encode(&service.device_shutdown(&req.guid).await?)
        }
        Method::DeviceSignalJoint => {
            let req = SignalJointRequest::from_bytes(payload)?;
            calls::encode(&service.device_signal_joint(&req.guid, req.joint_id).await?)
        }
        other => Err(RelayError::UnexpectedReply(format!("{other} is not callable"))),
    }
}

/// Hand a push frame to `handler`.
pub async fn deliver_push<H: PushHandler + ?Sized>(handler: &H, frame: &Frame) -> Result<()> {
    match Push::from_frame(frame)? {
        Push::RequestShutdown(req) => handler.on_request_shutdown(&req.reason, req.fatal).await,
        Push::RefreshInterface => handler.on_refresh_interface().await,
    }
    Ok(())
}
