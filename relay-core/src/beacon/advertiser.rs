//! Server-side beacon: answers discovery probes for one service type.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::socket::bind_udp;
use super::wire;
use super::DISCOVERY_PORT;
use crate::error::{RelayError, Result};

/// Largest datagram the advertiser reads.
const RECV_BUFFER: usize = 2048;

/// Announces a running service to anyone probing for its type.
///
/// The payload can be changed at any time with [`Advertiser::set_payload`];
/// the next response carries the new value.
#[derive(Debug)]
pub struct Advertiser {
    service_type: String,
    advertised_port: u16,
    discovery_port: u16,
    payload: watch::Sender<String>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Advertiser {
    /// An advertiser for `service_type` that points probers at
    /// `advertised_port`. Nothing is bound until [`Advertiser::start`].
    pub fn new(service_type: impl Into<String>, advertised_port: u16) -> Self {
        let (payload, _) = watch::channel(String::new());
        Self {
            service_type: service_type.into(),
            advertised_port,
            discovery_port: DISCOVERY_PORT,
            payload,
            token: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    /// Listen on a different discovery port than the well-known one.
    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn advertised_port(&self) -> u16 {
        self.advertised_port
    }

    /// Replace the payload sent in future responses.
    pub fn set_payload(&self, data: impl Into<String>) {
        self.payload.send_replace(data.into());
    }

    pub fn payload(&self) -> String {
        self.payload.borrow().clone()
    }

    /// Address of the bound discovery socket, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Bind the discovery port and start answering probes.
    pub async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(RelayError::Other("advertiser already started".into()));
        }

        // Validate the prefix once so a bad service type fails here
        // instead of on every probe.
        let prefix = wire::encode(&self.service_type)?;
        let socket = bind_udp(self.discovery_port)?;
        self.local_addr = socket.local_addr().ok();

        tracing::info!(
            service_type = %self.service_type,
            advertised_port = self.advertised_port,
            discovery_port = self.discovery_port,
            "beacon advertiser started"
        );

        let responder = Responder {
            socket,
            prefix,
            service_type: self.service_type.clone(),
            advertised_port: self.advertised_port,
            payload: self.payload.subscribe(),
        };
        let token = self.token.clone();
        self.task = Some(tokio::spawn(responder.run(token)));
        Ok(())
    }

    /// Stop answering probes and wait for the receive loop to exit.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
            tracing::info!(service_type = %self.service_type, "beacon advertiser stopped");
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ── Responder ────────────────────────────────────────────────────

struct Responder {
    socket: UdpSocket,
    prefix: Vec<u8>,
    service_type: String,
    advertised_port: u16,
    payload: watch::Receiver<String>,
}

impl Responder {
    async fn run(self, token: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.answer(&buf[..len], from).await,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some
                        // platforms; the socket stays usable.
                        tracing::debug!(error = %e, "beacon receive failed");
                    }
                },
            }
        }
    }

    async fn answer(&self, packet: &[u8], from: SocketAddr) {
        // Other service types share this port; stay quiet for them.
        if !wire::has_prefix(packet, &self.prefix) {
            return;
        }

        let payload = self.payload.borrow().clone();
        let response = match wire::response(&self.service_type, self.advertised_port, &payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode beacon response");
                return;
            }
        };

        match self.socket.send_to(&response, from).await {
            Ok(_) => tracing::trace!(%from, "answered probe"),
            Err(e) => tracing::warn!(%from, error = %e, "could not answer probe"),
        }
    }
}
