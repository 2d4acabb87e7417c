//! Discovered advertiser locations and the ordered set the prober keeps.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a location survives without a fresh response.
pub const BEACON_TIMEOUT: Duration = Duration::from_secs(5);

// ── DiscoveredLocation ───────────────────────────────────────────

/// One advertiser seen on the network.
///
/// Two locations are equal when their addresses are equal; payload and
/// timestamp are refreshed on every response without changing identity.
#[derive(Debug, Clone)]
pub struct DiscoveredLocation {
    /// Sender IP combined with the advertised service port.
    pub address: SocketAddr,
    /// Advertiser-chosen payload string.
    pub payload: String,
    /// When the last matching response arrived.
    pub last_seen: Instant,
}

impl DiscoveredLocation {
    pub fn new(address: SocketAddr, payload: impl Into<String>, last_seen: Instant) -> Self {
        Self {
            address,
            payload: payload.into(),
            last_seen,
        }
    }

    /// `true` once `timeout` has passed since the last response.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    fn order(&self, other: &Self) -> Ordering {
        self.payload
            .cmp(&other.payload)
            .then_with(|| self.address.ip().to_string().cmp(&other.address.ip().to_string()))
            .then_with(|| other.address.port().cmp(&self.address.port()))
    }
}

impl PartialEq for DiscoveredLocation {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DiscoveredLocation {}

// ── LocationSet ──────────────────────────────────────────────────

/// An immutable, sorted snapshot of discovered locations.
///
/// Ordered by payload, then by IP string, then by descending port.
/// Every change produces a new set; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct LocationSet {
    items: Arc<Vec<DiscoveredLocation>>,
}

impl LocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_unsorted(mut items: Vec<DiscoveredLocation>) -> Self {
        items.sort_by(DiscoveredLocation::order);
        Self {
            items: Arc::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiscoveredLocation> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[DiscoveredLocation] {
        &self.items
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&DiscoveredLocation> {
        self.items.iter().find(|l| l.address == *address)
    }

    /// A new set with any entry at `location.address` replaced by `location`.
    pub fn upsert(&self, location: DiscoveredLocation) -> Self {
        let mut items: Vec<_> = self
            .items
            .iter()
            .filter(|l| **l != location)
            .cloned()
            .collect();
        items.push(location);
        Self::from_unsorted(items)
    }

    /// A new set without the entries that went stale by `now`.
    pub fn prune(&self, now: Instant, timeout: Duration) -> Self {
        let items = self
            .items
            .iter()
            .filter(|l| !l.is_stale(now, timeout))
            .cloned()
            .collect();
        Self::from_unsorted(items)
    }

    /// Same addresses with the same payloads in the same order.
    ///
    /// Timestamps are ignored, so a repeat response from a known
    /// advertiser compares equivalent to the set before it.
    pub fn is_equivalent(&self, other: &LocationSet) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|(a, b)| a.address == b.address && a.payload == b.payload)
    }
}

impl<'a> IntoIterator for &'a LocationSet {
    type Item = &'a DiscoveredLocation;
    type IntoIter = std::slice::Iter<'a, DiscoveredLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
