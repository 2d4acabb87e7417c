//! Value snapshots of tracking devices and their joints.
//!
//! These travel over the wire (bincode) and are persisted in the settings
//! store (JSON), so they stay plain data: no handles back to a live device.

use serde::{Deserialize, Serialize};

// ── Math ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ── Joints ───────────────────────────────────────────────────────

/// Body part a joint stands for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JointRole {
    Head,
    Neck,
    SpineShoulder,
    ShoulderLeft,
    ElbowLeft,
    WristLeft,
    HandLeft,
    HandTipLeft,
    ThumbLeft,
    ShoulderRight,
    ElbowRight,
    WristRight,
    HandRight,
    HandTipRight,
    ThumbRight,
    SpineMiddle,
    SpineWaist,
    HipLeft,
    KneeLeft,
    FootLeft,
    FootTipLeft,
    HipRight,
    KneeRight,
    FootRight,
    FootTipRight,
    #[default]
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingState {
    #[default]
    NotTracked,
    Inferred,
    Tracked,
}

/// The state of one joint at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JointSnapshot {
    pub name: String,
    pub role: JointRole,
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub angular_velocity: Vec3,
    pub angular_acceleration: Vec3,
    pub tracking_state: TrackingState,
}

impl JointSnapshot {
    pub fn new(name: impl Into<String>, role: JointRole) -> Self {
        Self {
            name: name.into(),
            role,
            ..Self::default()
        }
    }

    pub fn with_pose(mut self, position: Vec3, orientation: Quat) -> Self {
        self.position = position;
        self.orientation = orientation;
        self
    }

    pub fn with_state(mut self, state: TrackingState) -> Self {
        self.tracking_state = state;
        self
    }
}

// ── Capabilities ─────────────────────────────────────────────────

bitflags::bitflags! {
    /// Optional behaviours a device advertises to the host.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CapabilityFlags: u32 {
        const POSITION_FILTER_BLOCKING = 1 << 0;
        const PHYSICS_OVERRIDE = 1 << 1;
        const FLIP_SUPPORTED = 1 << 2;
        const APP_ORIENTATION_SUPPORTED = 1 << 3;
        const SETTINGS_DAEMON_SUPPORTED = 1 << 4;
    }
}

// ── Status text ──────────────────────────────────────────────────

/// Status shown for a relayed device whose server is unreachable.
pub const PLACEHOLDER_STATUS: &str = "Remote device unavailable!\nE_NOT_INITIALIZED\n\
    The tracking relay is not available, so this remote device will not work right now. \
    Try refreshing the relay and checking its status.";

/// A device status string split into its three display parts.
///
/// Status strings have the shape `"Header\nCODE\nDescription"`; anything
/// else falls back to an "unknown" status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText {
    pub header: String,
    pub code: String,
    pub description: String,
}

impl StatusText {
    pub fn parse(text: &str) -> Self {
        let parts: Vec<&str> = text.split('\n').collect();
        match parts.as_slice() {
            [header, code, description] => Self {
                header: (*header).to_string(),
                code: (*code).to_string(),
                description: (*description).to_string(),
            },
            _ => Self::unknown(),
        }
    }

    pub fn unknown() -> Self {
        Self {
            header: "Unknown".into(),
            code: "S_UNKNWN".into(),
            description: "Status unavailable.".into(),
        }
    }
}

impl std::fmt::Display for StatusText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}\n{}", self.header, self.code, self.description)
    }
}

// ── RemoteDeviceSnapshot ─────────────────────────────────────────

/// Everything the relay knows about one device on the far side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteDeviceSnapshot {
    pub guid: String,
    pub name: String,
    pub status_code: i32,
    pub status_text: String,
    pub initialized: bool,
    pub skeleton_tracked: bool,
    pub capabilities: CapabilityFlags,
    pub joints: Vec<JointSnapshot>,
    pub error_docs_uri: Option<String>,
}

impl RemoteDeviceSnapshot {
    pub fn new(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn status(&self) -> StatusText {
        StatusText::parse(&self.status_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_splits_three_parts() {
        let s = StatusText::parse("Success!\nS_OK\nEverything works.");
        assert_eq!(s.header, "Success!");
        assert_eq!(s.code, "S_OK");
        assert_eq!(s.description, "Everything works.");
        assert_eq!(s.to_string(), "Success!\nS_OK\nEverything works.");
    }

    #[test]
    fn malformed_status_text_is_unknown() {
        assert_eq!(StatusText::parse("just text"), StatusText::unknown());
        assert_eq!(StatusText::parse("a\nb\nc\nd"), StatusText::unknown());
        assert_eq!(StatusText::parse(PLACEHOLDER_STATUS).code, "E_NOT_INITIALIZED");
    }

    #[test]
    fn snapshot_survives_json() {
        let mut dev = RemoteDeviceSnapshot::new("GUID-1", "Kinect");
        dev.capabilities = CapabilityFlags::FLIP_SUPPORTED | CapabilityFlags::PHYSICS_OVERRIDE;
        dev.joints.push(JointSnapshot::new("Head", JointRole::Head).with_state(TrackingState::Tracked));
        dev.error_docs_uri = Some("https://docs.example.org/err".into());

        let json = serde_json::to_string(&dev).unwrap();
        let back: RemoteDeviceSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dev);
    }

    #[test]
    fn snapshot_survives_bincode() {
        let mut dev = RemoteDeviceSnapshot::new("GUID-2", "Owo");
        dev.capabilities = CapabilityFlags::SETTINGS_DAEMON_SUPPORTED;
        dev.joints.push(JointSnapshot::new("Waist", JointRole::SpineWaist));

        let bytes = bincode::serialize(&dev).unwrap();
        let back: RemoteDeviceSnapshot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, dev);
    }
}
