//! # relay-core
//!
//! Core library for relaying tracking devices between hosts.
//!
//! This crate contains:
//! - **Beacon**: UDP `Advertiser` / `Prober` pair on the shared discovery port
//! - **Framing**: `FrameHeader`, `Frame`, `Method`, `MessageType` and the `RelayCodec`
//! - **Network**: `Connection` for framed TCP sessions with heartbeat
//! - **Service**: the `RelayService` call surface and request dispatch
//! - **Server**: `RelayServer` and `RelayHandler`, answering calls from host devices
//! - **Client**: `RelayClient` proxy and the `RelayBridge` status machine
//! - **Cache**: `DeviceSnapshotCache` with in-place / rebuild joint merges
//! - **Host**: traits the relay calls on its host application
//! - **Settings**: persisted named values
//! - **Error**: `RelayError`, a `thiserror`-based error hierarchy

pub mod beacon;
pub mod cache;
pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod host;
pub mod message;
pub mod network;
pub mod protocol;
pub mod server;
pub mod service;
pub mod settings;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use beacon::{Advertiser, DISCOVERY_PORT, DiscoveredLocation, LocationSet, Prober, ProberConfig};
pub use cache::{CacheEvent, CachedDevice, DeviceSnapshotCache, MergeOutcome};
pub use client::{BridgeConfig, RelayBridge, RelayClient, RelayedDevice};
pub use codec::RelayCodec;
pub use error::{RelayError, Result};
pub use frame::{Frame, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use header::{FrameHeader, HEADER_SIZE};
pub use host::{DeviceRegistry, HostBridge, MemoryHost, SimulatedDevice, TrackingDevice, UpdateLock};
pub use message::{MessageType, Method};
pub use network::{Connection, ConnectionInfo, ConnectionSender};
pub use protocol::{JointSnapshot, RemoteDeviceSnapshot, StatusText};
pub use server::{DEFAULT_SERVICE_PORT, RelayHandler, RelayServer, SERVICE_TYPE, ServerConfig, ServerStatus};
pub use service::{PushHandler, RelayService};
pub use settings::{JsonFileSettings, MemorySettings, SettingsExt, SettingsStore};
pub use state::RelayStatus;
