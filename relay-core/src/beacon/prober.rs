//! Client-side beacon prober.
//!
//! A probe loop broadcasts `LP(service_type)`, waits up to the probe
//! interval and prunes stale locations. A separate receive task handles
//! responses as they arrive. Both tasks fold their results into one
//! [`ProbeState`] behind a lock, and every change is published while that
//! lock is held, so listeners observe changes in packet order.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::location::{DiscoveredLocation, LocationSet, BEACON_TIMEOUT};
use super::socket::bind_udp;
use super::wire;
use super::{DISCOVERY_PORT, PROBE_INTERVAL};
use crate::error::{RelayError, Result};

const RECV_BUFFER: usize = 2048;

/// Callback invoked with every new location set.
pub type LocationListener = Box<dyn Fn(&LocationSet) + Send + Sync>;

// ── ProbeState ───────────────────────────────────────────────────

/// The prober's current view of the network.
///
/// Each mutation returns the new set only when it differs from the old
/// one in addresses, payloads or order.
#[derive(Debug, Default)]
pub struct ProbeState {
    locations: LocationSet,
}

impl ProbeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locations(&self) -> &LocationSet {
        &self.locations
    }

    /// Fold one response into the set.
    pub fn record(&mut self, location: DiscoveredLocation) -> Option<LocationSet> {
        let next = self.locations.upsert(location);
        self.replace(next)
    }

    /// Drop locations that have been silent longer than `timeout`.
    pub fn prune(&mut self, now: Instant, timeout: Duration) -> Option<LocationSet> {
        let next = self.locations.prune(now, timeout);
        self.replace(next)
    }

    fn replace(&mut self, next: LocationSet) -> Option<LocationSet> {
        let changed = !next.is_equivalent(&self.locations);
        // Timestamps refresh even when nothing visible changed.
        self.locations = next;
        changed.then(|| self.locations.clone())
    }
}

// ── ProberConfig ─────────────────────────────────────────────────

/// Where and how often a [`Prober`] looks for advertisers.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Service type tag probes and responses must start with.
    pub service_type: String,
    /// Destination address for probes; the limited broadcast address
    /// unless a test or a routed setup needs unicast.
    pub target: IpAddr,
    /// Port advertisers listen on.
    pub discovery_port: u16,
    /// Pause between probes.
    pub interval: Duration,
    /// Silence after which a location is dropped.
    pub timeout: Duration,
}

impl ProberConfig {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            target: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port: DISCOVERY_PORT,
            interval: PROBE_INTERVAL,
            timeout: BEACON_TIMEOUT,
        }
    }
}

// ── Prober ───────────────────────────────────────────────────────

/// Lifecycle of a [`Prober`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProberPhase {
    Created,
    Running,
    Stopped,
}

struct Shared {
    config: ProberConfig,
    prefix: Vec<u8>,
    state: Mutex<ProbeState>,
    updates: watch::Sender<LocationSet>,
    listeners: Mutex<Vec<LocationListener>>,
}

impl Shared {
    async fn publish(&self, set: LocationSet) {
        tracing::debug!(count = set.len(), "discovered locations changed");
        for listener in self.listeners.lock().await.iter() {
            listener(&set);
        }
        self.updates.send_replace(set);
    }

    async fn handle_packet(&self, packet: &[u8], from: SocketAddr) {
        let response = match wire::parse_response(packet, &self.prefix) {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping malformed beacon response");
                return;
            }
        };

        let address = SocketAddr::new(from.ip(), response.port);
        let location = DiscoveredLocation::new(address, response.payload, Instant::now());

        let mut state = self.state.lock().await;
        if let Some(set) = state.record(location) {
            self.publish(set).await;
        }
    }

    async fn prune(&self) {
        let mut state = self.state.lock().await;
        if let Some(set) = state.prune(Instant::now(), self.config.timeout) {
            self.publish(set).await;
        }
    }

    async fn broadcast(&self, socket: &UdpSocket) -> Result<()> {
        let probe = wire::probe(&self.config.service_type)?;
        let target = SocketAddr::new(self.config.target, self.config.discovery_port);
        socket.send_to(&probe, target).await?;
        Ok(())
    }
}

/// Discovers advertisers of one service type and keeps a live,
/// ordered view of them.
pub struct Prober {
    shared: Arc<Shared>,
    phase: ProberPhase,
    socket: Option<Arc<UdpSocket>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Prober {
    pub fn new(config: ProberConfig) -> Result<Self> {
        let prefix = wire::encode(&config.service_type)?;
        let (updates, _) = watch::channel(LocationSet::new());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                prefix,
                state: Mutex::new(ProbeState::new()),
                updates,
                listeners: Mutex::new(Vec::new()),
            }),
            phase: ProberPhase::Created,
            socket: None,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn phase(&self) -> ProberPhase {
        self.phase
    }

    pub fn config(&self) -> &ProberConfig {
        &self.shared.config
    }

    /// Register a callback run on every change, in order, while the
    /// prober's state lock is held. Callbacks must not block.
    pub async fn on_change<F>(&self, listener: F)
    where
        F: Fn(&LocationSet) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().await.push(Box::new(listener));
    }

    /// A receiver that always holds the latest location set.
    pub fn subscribe(&self) -> watch::Receiver<LocationSet> {
        self.shared.updates.subscribe()
    }

    /// The current location set.
    pub async fn locations(&self) -> LocationSet {
        self.shared.state.lock().await.locations().clone()
    }

    /// Bind a socket and launch the probe and receive tasks.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != ProberPhase::Created {
            return Err(RelayError::Other(format!(
                "cannot start prober in {:?} phase",
                self.phase
            )));
        }

        let socket = Arc::new(bind_udp(0)?);
        self.socket = Some(socket.clone());

        let receive = {
            let shared = self.shared.clone();
            let socket = socket.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER];
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        result = socket.recv_from(&mut buf) => match result {
                            Ok((len, from)) => shared.handle_packet(&buf[..len], from).await,
                            Err(e) => tracing::debug!(error = %e, "probe receive failed"),
                        },
                    }
                }
            })
        };

        let probe = {
            let shared = self.shared.clone();
            let token = self.token.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = shared.broadcast(&socket).await {
                        tracing::warn!(error = %e, "beacon probe failed");
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(shared.config.interval) => {}
                    }
                    shared.prune().await;
                }
            })
        };

        self.tasks = vec![receive, probe];
        self.phase = ProberPhase::Running;
        tracing::info!(
            service_type = %self.shared.config.service_type,
            target = %self.shared.config.target,
            port = self.shared.config.discovery_port,
            "beacon prober started"
        );
        Ok(())
    }

    /// Send a single probe now, outside the regular cycle.
    pub async fn broadcast_probe(&self) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| RelayError::Other("prober is not running".into()))?;
        self.shared.broadcast(socket).await
    }

    /// Drop stale locations now, outside the regular cycle.
    pub async fn prune_beacons(&self) {
        self.shared.prune().await;
    }

    /// Stop both tasks and wait for them to exit.
    ///
    /// No callbacks run after this returns.
    pub async fn stop(&mut self) {
        if self.phase == ProberPhase::Stopped {
            return;
        }
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.socket = None;
        self.phase = ProberPhase::Stopped;
        tracing::info!(service_type = %self.shared.config.service_type, "beacon prober stopped");
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn repeat_response_does_not_notify() {
        let t0 = Instant::now();
        let mut state = ProbeState::new();
        assert!(state.record(DiscoveredLocation::new(addr("10.0.0.1:1"), "A", t0)).is_some());
        assert!(state
            .record(DiscoveredLocation::new(addr("10.0.0.1:1"), "A", t0 + Duration::from_secs(1)))
            .is_none());
        // the refresh still counts for pruning
        assert!(state.prune(t0 + Duration::from_secs(5), BEACON_TIMEOUT).is_none());
        assert_eq!(state.locations().len(), 1);
    }

    #[test]
    fn payload_change_notifies() {
        let t0 = Instant::now();
        let mut state = ProbeState::new();
        state.record(DiscoveredLocation::new(addr("10.0.0.1:1"), "A", t0));
        let set = state
            .record(DiscoveredLocation::new(addr("10.0.0.1:1"), "B", t0))
            .unwrap();
        assert_eq!(set.as_slice()[0].payload, "B");
    }

    #[test]
    fn prune_notifies_on_removal() {
        let t0 = Instant::now();
        let mut state = ProbeState::new();
        state.record(DiscoveredLocation::new(addr("10.0.0.1:1"), "A", t0));
        assert!(state.prune(t0 + Duration::from_secs(4), BEACON_TIMEOUT).is_none());
        let set = state.prune(t0 + Duration::from_secs(6), BEACON_TIMEOUT).unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let mut config = ProberConfig::new("X");
        config.target = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.discovery_port = 9; // discard
        let mut prober = Prober::new(config).unwrap();
        prober.start().await.unwrap();
        assert_eq!(prober.phase(), ProberPhase::Running);

        prober.stop().await;
        assert_eq!(prober.phase(), ProberPhase::Stopped);
        assert!(prober.start().await.is_err());
        assert!(prober.broadcast_probe().await.is_err());
    }

    #[tokio::test]
    async fn malformed_packets_do_not_notify() {
        let prober = Prober::new(ProberConfig::new("X")).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        prober
            .on_change(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let from = addr("10.0.0.7:35891");
        let mut truncated = wire::encode("X").unwrap();
        truncated.extend_from_slice(&[0x13, 0x88, 0x00, 0x09, b'h']);
        prober.shared.handle_packet(&truncated, from).await;
        prober.shared.handle_packet(&wire::response("Y", 1, "p").unwrap(), from).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        prober.shared.handle_packet(&wire::response("X", 5000, "p").unwrap(), from).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let set = prober.locations().await;
        assert_eq!(set.as_slice()[0].address, addr("10.0.0.7:5000"));
    }
}
