//! Client-observed status of a relay bridge.
//!
//! ```text
//!  NotInitialized ──► Success ◄──────────────┐
//!        │               │                   │ (refresh)
//!        │               ├──► ConnectionLost ┤
//!        │               └──► DevicesListEmpty
//!        ├──► ServiceError      (bad target, nothing attempted)
//!        ├──► ConnectionError   (first ping / list failed)
//!        └──► BackFeedDetected  (client points at its own server)
//!
//!  any ──► Disconnected (explicit close)
//!  any ──► Other        (a failure that is not the transport's, e.g. a fault)
//! ```
//!
//! Only `Success` means live data; every other status makes readers fall
//! back to the cached device list.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

use crate::protocol::StatusText;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayStatus {
    Success,
    /// The session could not even be constructed.
    ServiceError,
    /// The initial connection test failed.
    ConnectionError,
    /// A session that used to work failed mid-use.
    ConnectionLost,
    /// The server answered but has no devices.
    DevicesListEmpty,
    /// The client would connect to this process's own server.
    BackFeedDetected,
    /// Closed on purpose.
    Disconnected,
    #[default]
    NotInitialized,
    Other,
}

impl RelayStatus {
    /// Numeric code reported as the relay device's status.
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ServiceError => 1,
            Self::ConnectionError => 2,
            Self::ConnectionLost => 3,
            Self::DevicesListEmpty => 4,
            Self::BackFeedDetected => 5,
            Self::Disconnected => 6,
            Self::NotInitialized => 7,
            Self::Other => 8,
        }
    }

    /// `true` only when device data comes straight from the server.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// `true` when a session was established at some point, so a new
    /// failure counts as a lost connection rather than a failed one.
    pub fn had_session(&self) -> bool {
        matches!(self, Self::Success | Self::DevicesListEmpty | Self::ConnectionLost)
    }

    /// Status to move to when a call fails from this status.
    ///
    /// Only transport failures count against the connection; anything
    /// else, e.g. a fault returned by a live server, is `Other`.
    pub fn after_failure(&self, error: &RelayError) -> RelayStatus {
        if !error.is_disconnect() {
            Self::Other
        } else if self.had_session() {
            Self::ConnectionLost
        } else {
            Self::ConnectionError
        }
    }

    /// Three-part display text, with `cause` as the description when
    /// the status has one.
    pub fn describe(&self, cause: Option<&str>) -> StatusText {
        let (header, code, fallback) = match self {
            Self::Success => ("Success!", "S_OK", "Everything's all fine!"),
            Self::ServiceError => ("Service error!", "E_SERVICE", "The relay session could not be created."),
            Self::ConnectionError => ("Connection error!", "E_CONNECTION", "The relay server did not answer."),
            Self::ConnectionLost => ("Connection lost!", "E_CONNECTION_LOST", "The relay server stopped answering."),
            Self::DevicesListEmpty => ("No devices!", "E_NO_DEVICES", "The relay server has no devices to share."),
            Self::BackFeedDetected => ("Backfeed detected!", "E_BACKFEED", "The relay client points at this instance's own server."),
            Self::Disconnected => ("Disconnected", "S_DISCONNECTED", "The relay was disconnected."),
            Self::NotInitialized => ("Not initialized", "E_NOT_INITIALIZED", "The relay has not been started yet."),
            Self::Other => ("Error", "E_UNKNOWN", "An unknown error occurred."),
        };
        StatusText {
            header: header.into(),
            code: code.into(),
            description: cause.unwrap_or(fallback).into(),
        }
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_initialized() {
        assert_eq!(RelayStatus::default(), RelayStatus::NotInitialized);
        assert!(!RelayStatus::default().is_live());
    }

    #[test]
    fn failure_after_success_is_lost() {
        let dropped = RelayError::ChannelClosed;
        assert_eq!(RelayStatus::Success.after_failure(&dropped), RelayStatus::ConnectionLost);
        assert_eq!(RelayStatus::DevicesListEmpty.after_failure(&dropped), RelayStatus::ConnectionLost);
        assert_eq!(RelayStatus::NotInitialized.after_failure(&dropped), RelayStatus::ConnectionError);
        assert_eq!(
            RelayStatus::Disconnected.after_failure(&RelayError::Timeout(std::time::Duration::from_secs(5))),
            RelayStatus::ConnectionError
        );
        assert_eq!(RelayStatus::Success.after_failure(&RelayError::Cancelled), RelayStatus::ConnectionLost);
    }

    #[test]
    fn non_transport_failures_are_other() {
        let fault = RelayError::Remote {
            method: "DeviceInitialize".into(),
            message: "bad arguments".into(),
        };
        assert_eq!(RelayStatus::Success.after_failure(&fault), RelayStatus::Other);
        assert_eq!(RelayStatus::NotInitialized.after_failure(&fault), RelayStatus::Other);
        assert_eq!(
            RelayStatus::Success.after_failure(&RelayError::Serialization("short payload".into())),
            RelayStatus::Other
        );
        assert_eq!(
            RelayStatus::Success.after_failure(&RelayError::UnexpectedReply("Push".into())),
            RelayStatus::Other
        );
    }

    #[test]
    fn describe_uses_cause() {
        let text = RelayStatus::ConnectionError.describe(Some("timeout after 5s"));
        assert_eq!(text.code, "E_CONNECTION");
        assert_eq!(text.description, "timeout after 5s");
        assert_eq!(RelayStatus::Success.describe(None).code, "S_OK");
    }

    #[test]
    fn codes_are_distinct() {
        let all = [
            RelayStatus::Success,
            RelayStatus::ServiceError,
            RelayStatus::ConnectionError,
            RelayStatus::ConnectionLost,
            RelayStatus::DevicesListEmpty,
            RelayStatus::BackFeedDetected,
            RelayStatus::Disconnected,
            RelayStatus::NotInitialized,
            RelayStatus::Other,
        ];
        let mut codes: Vec<_> = all.iter().map(|s| s.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}
