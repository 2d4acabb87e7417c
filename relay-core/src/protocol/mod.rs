//! Payload definitions carried inside relay [`Frame`]s.
//!
//! Payloads are serialized with `serde` + `bincode`. Device snapshots are
//! also persisted as JSON in the settings store.
//!
//! [`Frame`]: crate::frame::Frame

pub mod calls;
pub mod device;

pub use calls::{DeviceRequest, Push, ShutdownRequest, SignalJointRequest};
pub use device::{
    CapabilityFlags, JointRole, JointSnapshot, PLACEHOLDER_STATUS, Quat, RemoteDeviceSnapshot,
    StatusText, TrackingState, Vec3,
};
