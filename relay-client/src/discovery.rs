//! Finding a relay server through its beacon.

use std::time::Duration;

use relay_core::ConnectionInfo;
use relay_core::beacon::{LocationSet, Prober, ProberConfig};
use relay_core::error::Result;

use crate::config::DiscoverySection;

/// Probe for `wait` and return every server that answered.
pub async fn discover(section: &DiscoverySection, wait: Duration) -> Result<LocationSet> {
    let mut config = ProberConfig::new(section.service_type.clone());
    config.discovery_port = section.port;

    let mut prober = Prober::new(config)?;
    let mut updates = prober.subscribe();
    prober.start().await?;

    // return early on the first answer, then give stragglers a moment
    let first = tokio::time::timeout(wait, updates.changed()).await;
    if first.is_ok() {
        tokio::time::sleep(Duration::from_millis(250).min(wait)).await;
    }

    let found = prober.locations().await;
    prober.stop().await;
    tracing::debug!(count = found.len(), "discovery finished");
    Ok(found)
}

/// The preferred server among `locations`: the first in set order.
pub fn pick(locations: &LocationSet) -> Option<ConnectionInfo> {
    locations
        .iter()
        .next()
        .map(|l| ConnectionInfo::new(l.address.ip().to_string(), l.address.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::beacon::DiscoveredLocation;
    use std::time::Instant;

    #[test]
    fn pick_prefers_set_order() {
        let now = Instant::now();
        let set = LocationSet::new()
            .upsert(DiscoveredLocation::new("10.0.0.2:10042".parse().unwrap(), "B", now))
            .upsert(DiscoveredLocation::new("10.0.0.5:10043".parse().unwrap(), "A", now));
        assert_eq!(pick(&set), Some(ConnectionInfo::new("10.0.0.5", 10043)));
        assert_eq!(pick(&LocationSet::new()), None);
    }
}
