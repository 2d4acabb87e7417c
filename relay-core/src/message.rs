//! Frame kinds and the relay method table.
//!
//! Uses proper enums with `TryFrom`; unknown values are errors, not panics.

use crate::error::RelayError;
use std::fmt;

// ── MessageType ──────────────────────────────────────────────────

/// What a frame is for.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A call from client to server.
    Request = 0x1,
    /// A successful reply to a `Request` with the same id.
    Response = 0x2,
    /// A failed reply; the payload is a UTF-8 error message.
    Fault = 0x3,
    /// A server-initiated notification; no reply expected.
    Push = 0x4,
}

impl TryFrom<u32> for MessageType {
    type Error = RelayError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(MessageType::Request),
            0x2 => Ok(MessageType::Response),
            0x3 => Ok(MessageType::Fault),
            0x4 => Ok(MessageType::Push),
            _ => Err(RelayError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Method ───────────────────────────────────────────────────────

/// Every call and push understood by the relay.
///
/// Organized by category:
/// - `0x00xx`: session housekeeping
/// - `0x01xx`: service identity and lifetime
/// - `0x02xx`: device enumeration and polling
/// - `0x03xx`: device control
/// - `0x04xx`: server pushes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    // ── Session (0x00xx) ─────────────────────────────────────────
    /// Keep-alive, sent on request id 0 and never answered.
    Heartbeat = 0x0001,
    /// The client is closing the session.
    Goodbye = 0x0002,

    // ── Service (0x01xx) ─────────────────────────────────────────
    PingService = 0x0101,
    RequestShutdown = 0x0102,
    GetRemoteHostname = 0x0103,

    // ── Devices (0x02xx) ─────────────────────────────────────────
    ListTrackingDevices = 0x0201,
    GetTrackingDevice = 0x0202,
    GetTrackedJoints = 0x0203,

    // ── Device control (0x03xx) ──────────────────────────────────
    DeviceInitialize = 0x0301,
    DeviceShutdown = 0x0302,
    DeviceSignalJoint = 0x0303,

    // ── Pushes (0x04xx) ──────────────────────────────────────────
    OnRequestShutdown = 0x0401,
    OnRefreshInterface = 0x0402,
}

impl Method {
    /// `true` for methods only ever sent as pushes.
    pub fn is_push(&self) -> bool {
        matches!(self, Method::OnRequestShutdown | Method::OnRefreshInterface)
    }

    /// `true` for session housekeeping that never gets a reply.
    pub fn is_session(&self) -> bool {
        matches!(self, Method::Heartbeat | Method::Goodbye)
    }
}

impl TryFrom<u32> for Method {
    type Error = RelayError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Method::Heartbeat),
            0x0002 => Ok(Method::Goodbye),
            0x0101 => Ok(Method::PingService),
            0x0102 => Ok(Method::RequestShutdown),
            0x0103 => Ok(Method::GetRemoteHostname),
            0x0201 => Ok(Method::ListTrackingDevices),
            0x0202 => Ok(Method::GetTrackingDevice),
            0x0203 => Ok(Method::GetTrackedJoints),
            0x0301 => Ok(Method::DeviceInitialize),
            0x0302 => Ok(Method::DeviceShutdown),
            0x0303 => Ok(Method::DeviceSignalJoint),
            0x0401 => Ok(Method::OnRequestShutdown),
            0x0402 => Ok(Method::OnRefreshInterface),
            _ => Err(RelayError::UnknownVariant {
                type_name: "Method",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Method; 13] = [
        Method::Heartbeat,
        Method::Goodbye,
        Method::PingService,
        Method::RequestShutdown,
        Method::GetRemoteHostname,
        Method::ListTrackingDevices,
        Method::GetTrackingDevice,
        Method::GetTrackedJoints,
        Method::DeviceInitialize,
        Method::DeviceShutdown,
        Method::DeviceSignalJoint,
        Method::OnRequestShutdown,
        Method::OnRefreshInterface,
    ];

    #[test]
    fn method_discriminants_map_back() {
        for m in ALL {
            assert_eq!(Method::try_from(m as u32).unwrap(), m);
        }
    }

    #[test]
    fn unknown_values_are_errors() {
        assert!(MessageType::try_from(0).is_err());
        assert!(Method::try_from(0x0999).is_err());
    }

    #[test]
    fn categories() {
        assert!(Method::OnRefreshInterface.is_push());
        assert!(!Method::PingService.is_push());
        assert!(Method::Heartbeat.is_session());
        assert_eq!(Method::GetTrackedJoints.to_string(), "GetTrackedJoints");
    }
}
