//! Server role: accepts relay sessions and advertises itself on the
//! discovery port.
//!
//! Each accepted connection gets its own session task that answers calls
//! one after another through a [`SessionService`]. Pushes reach a session
//! once it has pinged.

pub mod demand;
pub mod handler;
pub mod router;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::beacon::{Advertiser, DISCOVERY_PORT};
use crate::error::{RelayError, Result};
use crate::message::Method;
use crate::network::{Connection, ConnectionInfo};
use crate::service::dispatch;
use crate::settings::{SettingsExt, SettingsStore, keys};

pub use demand::{LOCAL_SESSION, SessionId, UpdateDemandSet};
pub use handler::{RelayHandler, SessionService, local_hostname};
pub use router::{PushRouter, PushStats};

/// Port the RPC endpoint listens on unless configured otherwise.
pub const DEFAULT_SERVICE_PORT: u16 = 10042;

/// Service type advertised on the discovery port.
pub const SERVICE_TYPE: &str = "TrackingRelay";

/// `true` when a client aimed at `client` would land on a server
/// listening on `server_port` in this process.
pub fn detect_backfeed(server_port: u16, client: &ConnectionInfo) -> bool {
    client.is_loopback() && client.port() == server_port
}

/// IPv4 addresses of this machine's interfaces, for display.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter_map(|(_, ip)| match ip {
                IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "could not list network interfaces");
            Vec::new()
        }
    };
    out.sort();
    out.dedup();
    if out.is_empty() {
        out.push(Ipv4Addr::LOCALHOST);
    }
    out
}

/// The persisted service port, or the default.
pub fn configured_port(settings: &dyn SettingsStore) -> u16 {
    settings.get_or(keys::SERVER_PORT, DEFAULT_SERVICE_PORT)
}

// ── Config & status ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub service_type: String,
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            port: DISCOVERY_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Advertise on the discovery port; `None` keeps the server silent.
    pub discovery: Option<DiscoveryConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_SERVICE_PORT,
            discovery: Some(DiscoveryConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServerStatus {
    #[default]
    NotInitialized,
    Running(SocketAddr),
    Failed(String),
}

impl ServerStatus {
    /// 0 while running, 1 after a failure, -1 before the first start.
    pub fn code(&self) -> i32 {
        match self {
            Self::Running(_) => 0,
            Self::Failed(_) => 1,
            Self::NotInitialized => -1,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(addr) => write!(f, "Success!\nS_OK\nRelay server is listening on port {}.", addr.port()),
            Self::Failed(cause) => write!(f, "Server error!\nE_FAILED\n{cause}"),
            Self::NotInitialized => write!(f, "Not initialized\nE_NOT_INITIALIZED\nThe relay server has not been started yet."),
        }
    }
}

// ── RelayServer ──────────────────────────────────────────────────

pub struct RelayServer {
    handler: Arc<RelayHandler>,
    config: ServerConfig,
    status: ServerStatus,
    advertiser: Option<Advertiser>,
    sessions: CancellationToken,
    listener: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(handler: Arc<RelayHandler>, config: ServerConfig) -> Self {
        Self {
            handler,
            config,
            status: ServerStatus::NotInitialized,
            advertiser: None,
            sessions: CancellationToken::new(),
            listener: CancellationToken::new(),
            accept_task: None,
        }
    }

    pub fn handler(&self) -> &Arc<RelayHandler> {
        &self.handler
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> &ServerStatus {
        &self.status
    }

    /// Address the RPC endpoint is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.status {
            ServerStatus::Running(addr) => Some(addr),
            _ => None,
        }
    }

    /// Address of the discovery socket while advertising.
    pub fn beacon_addr(&self) -> Option<SocketAddr> {
        self.advertiser.as_ref().and_then(|a| a.local_addr())
    }

    /// Bind the RPC endpoint, start accepting sessions, then advertise.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.accept_task.is_some() {
            return Err(RelayError::Other("relay server already started".into()));
        }

        let listener = match TcpListener::bind((self.config.bind, self.config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.status = ServerStatus::Failed(e.to_string());
                tracing::error!(port = self.config.port, error = %e, "relay server failed to bind");
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;

        self.sessions = CancellationToken::new();
        self.listener = CancellationToken::new();
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.listener.clone(),
            self.sessions.clone(),
        )));

        if let Some(discovery) = &self.config.discovery {
            let mut advertiser =
                Advertiser::new(discovery.service_type.clone(), addr.port()).with_discovery_port(discovery.port);
            advertiser.set_payload(addr.port().to_string());
            match advertiser.start().await {
                Ok(()) => self.advertiser = Some(advertiser),
                // the RPC endpoint still works for clients that know the address
                Err(e) => tracing::warn!(error = %e, "beacon advertiser unavailable"),
            }
        }

        self.status = ServerStatus::Running(addr);
        tracing::info!(%addr, "relay server started");
        Ok(addr)
    }

    /// Stop advertising, cancel every session, close the listener and
    /// wait for all of it to finish.
    pub async fn stop(&mut self) {
        if let Some(mut advertiser) = self.advertiser.take() {
            advertiser.stop().await;
        }
        self.sessions.cancel();
        self.listener.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
            tracing::info!("relay server stopped");
        }
        if self.status.is_running() {
            self.status = ServerStatus::NotInitialized;
        }
    }

    /// Update in-demand devices. Does nothing unless the server runs.
    pub async fn heartbeat(&self) -> usize {
        if !self.status.is_running() {
            return 0;
        }
        self.handler.heartbeat().await
    }

    /// `true` when a client aimed at `client` would reach this server.
    pub fn is_backfeed(&self, client: &ConnectionInfo) -> bool {
        let port = self.local_addr().map_or(self.config.port, |a| a.port());
        detect_backfeed(port, client)
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.sessions.cancel();
        self.listener.cancel();
    }
}

// ── Tasks ────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<RelayHandler>,
    token: CancellationToken,
    sessions_token: CancellationToken,
) {
    let mut next_id: SessionId = LOCAL_SESSION + 1;
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let conn = match Connection::new(stream) {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "failed to set up session");
                            continue;
                        }
                    };
                    let id = next_id;
                    next_id += 1;
                    tracing::info!(%peer, session = id, "relay session opened");
                    sessions.spawn(run_session(handler.clone(), id, conn, sessions_token.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }

    drop(listener);
    while sessions.join_next().await.is_some() {}
}

async fn run_session(handler: Arc<RelayHandler>, id: SessionId, conn: Connection, token: CancellationToken) {
    let peer = conn.peer_addr();
    let closed = conn.closed_token();
    let (tx, mut rx, _guard) = conn.into_parts();
    let service = handler.session(id, tx.clone());

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if frame.method() == Method::Goodbye {
            tracing::debug!(%peer, session = id, "client said goodbye");
            break;
        }

        let reply = tokio::select! {
            _ = token.cancelled() => break,
            reply = dispatch(&service, &frame) => reply,
        };
        if let Some(reply) = reply {
            if tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    handler.release_session(id).await;
    tracing::info!(%peer, session = id, "relay session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryHost, update_lock};
    use crate::settings::MemorySettings;

    #[test]
    fn backfeed_needs_loopback_and_same_port() {
        assert!(detect_backfeed(10042, &ConnectionInfo::new("127.0.0.1", 10042)));
        assert!(detect_backfeed(10042, &ConnectionInfo::new("localhost", 10042)));
        assert!(!detect_backfeed(10042, &ConnectionInfo::new("127.0.0.1", 10043)));
        assert!(!detect_backfeed(10042, &ConnectionInfo::new("192.168.1.20", 10042)));
    }

    #[test]
    fn port_comes_from_settings() {
        let settings = MemorySettings::new();
        assert_eq!(configured_port(&settings), DEFAULT_SERVICE_PORT);
        settings.set(keys::SERVER_PORT, &12000u16).unwrap();
        assert_eq!(configured_port(&settings), 12000);
    }

    #[test]
    fn status_codes_and_text() {
        assert_eq!(ServerStatus::default().code(), -1);
        assert_eq!(ServerStatus::Failed("x".into()).code(), 1);
        let running = ServerStatus::Running("127.0.0.1:10042".parse().unwrap());
        assert_eq!(running.code(), 0);
        assert!(running.to_string().starts_with("Success!\nS_OK\n"));
    }

    #[test]
    fn ipv4_listing_is_never_empty() {
        assert!(!local_ipv4_addresses().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_skipped_when_not_running() {
        let host = Arc::new(MemoryHost::new());
        let handler = Arc::new(RelayHandler::new(host.clone(), host, update_lock()));
        let server = RelayServer::new(handler, ServerConfig::default());
        assert_eq!(server.heartbeat().await, 0);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn start_and_stop_on_ephemeral_port() {
        let host = Arc::new(MemoryHost::new());
        let handler = Arc::new(RelayHandler::new(host.clone(), host, update_lock()));
        let mut server = RelayServer::new(
            handler,
            ServerConfig {
                bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                discovery: None,
            },
        );

        let addr = server.start().await.unwrap();
        assert!(server.status().is_running());
        assert!(server.start().await.is_err());

        server.stop().await;
        assert!(!server.status().is_running());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
