//! UDP discovery: an [`Advertiser`] answers probes on the well-known
//! discovery port and a [`Prober`] collects the answers into a live
//! [`LocationSet`].

pub mod advertiser;
pub mod location;
pub mod prober;
pub mod socket;
pub mod wire;

use std::time::Duration;

pub use advertiser::Advertiser;
pub use location::{BEACON_TIMEOUT, DiscoveredLocation, LocationSet};
pub use prober::{LocationListener, ProbeState, Prober, ProberConfig, ProberPhase};

/// Well-known UDP port for probes and responses.
pub const DISCOVERY_PORT: u16 = 35891;

/// Pause between two probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(2000);
