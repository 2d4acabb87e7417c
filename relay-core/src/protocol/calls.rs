//! Request, reply and push payloads for the relay method table.
//!
//! # Wire Protocol
//!
//! ```text
//! Client ──[Request  method, id=N]──────────► Server
//!   Payload: argument struct (bincode), empty for argument-less calls
//!
//! Server ──[Response method, id=N]──────────► Client
//!   Payload: the method's return value (bincode)
//!
//! Server ──[Fault    method, id=N]──────────► Client
//!   Payload: UTF-8 error message
//!
//! Server ──[Push     OnRequestShutdown]─────► every client
//!   Payload: ShutdownRequest (bincode)
//!
//! Server ──[Push     OnRefreshInterface]────► every client
//!   Payload: empty
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::frame::Frame;
use crate::message::{MessageType, Method};

/// Serialize a payload value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a payload value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

// ── Arguments ────────────────────────────────────────────────────

/// Arguments of `RequestShutdown` and the `OnRequestShutdown` push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub reason: String,
    pub fatal: bool,
}

impl ShutdownRequest {
    pub fn new(reason: impl Into<String>, fatal: bool) -> Self {
        Self {
            reason: reason.into(),
            fatal,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Arguments of every call that targets a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub guid: String,
}

impl DeviceRequest {
    pub fn new(guid: impl Into<String>) -> Self {
        Self { guid: guid.into() }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Arguments of `DeviceSignalJoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalJointRequest {
    pub guid: String,
    pub joint_id: i32,
}

impl SignalJointRequest {
    pub fn new(guid: impl Into<String>, joint_id: i32) -> Self {
        Self {
            guid: guid.into(),
            joint_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

// ── Pushes ───────────────────────────────────────────────────────

/// A notification the server sends to every connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// The server is going away, or asks its clients to.
    RequestShutdown(ShutdownRequest),
    /// The server's device list changed.
    RefreshInterface,
}

impl Push {
    pub fn method(&self) -> Method {
        match self {
            Push::RequestShutdown(_) => Method::OnRequestShutdown,
            Push::RefreshInterface => Method::OnRefreshInterface,
        }
    }

    pub fn into_frame(self) -> Result<Frame> {
        let method = self.method();
        let payload = match self {
            Push::RequestShutdown(req) => req.to_bytes()?,
            Push::RefreshInterface => Vec::new(),
        };
        Frame::push(method, payload)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.message_type() != MessageType::Push {
            return Err(RelayError::UnexpectedReply(format!(
                "{} frame is not a push",
                frame.message_type()
            )));
        }
        match frame.method() {
            Method::OnRequestShutdown => Ok(Push::RequestShutdown(ShutdownRequest::from_bytes(
                frame.payload(),
            )?)),
            Method::OnRefreshInterface => Ok(Push::RefreshInterface),
            other => Err(RelayError::UnexpectedReply(format!("{other} is not a push method"))),
        }
    }
}

/// Milliseconds since the Unix epoch, as returned by `PingService`.
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::device::RemoteDeviceSnapshot;

    #[test]
    fn push_frames_parse_back() {
        let push = Push::RequestShutdown(ShutdownRequest::new("server closing", true));
        let frame = push.clone().into_frame().unwrap();
        assert_eq!(frame.method(), Method::OnRequestShutdown);
        assert_eq!(Push::from_frame(&frame).unwrap(), push);

        let frame = Push::RefreshInterface.into_frame().unwrap();
        assert!(frame.payload().is_empty());
        assert_eq!(Push::from_frame(&frame).unwrap(), Push::RefreshInterface);
    }

    #[test]
    fn request_frame_is_not_a_push() {
        let frame = Frame::request(1, Method::PingService, Vec::new()).unwrap();
        assert!(Push::from_frame(&frame).is_err());
    }

    #[test]
    fn optional_replies() {
        let none: Option<RemoteDeviceSnapshot> = None;
        let bytes = encode(&none).unwrap();
        assert_eq!(decode::<Option<RemoteDeviceSnapshot>>(&bytes).unwrap(), None);
    }

    #[test]
    fn garbage_payload_is_a_serialization_error() {
        assert!(matches!(
            DeviceRequest::from_bytes(&[0xFF]),
            Err(RelayError::Serialization(_))
        ));
    }
}
