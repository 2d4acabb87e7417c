use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::codec::RelayCodec;
use crate::error::{RelayError, Result};
use crate::frame::Frame;
use crate::message::Method;

/// Interval between keep-alive frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const CHANNEL_CAPACITY: usize = 100;

/// Cloneable handle that queues frames on a connection's writer task.
pub type ConnectionSender = mpsc::Sender<Frame>;

/// A framed relay session over one TCP stream.
///
/// Background tasks own the socket: a writer draining the outbound queue,
/// a reader feeding the inbound queue, and a heartbeat. Dropping the
/// connection (or its guard, after [`Connection::into_parts`]) stops all
/// three and closes the socket.
#[derive(Debug)]
pub struct Connection {
    // Channel to send frames to the background writer task
    tx: ConnectionSender,
    // Channel to receive frames from the background reader task
    rx: mpsc::Receiver<Frame>,
    peer: SocketAddr,
    token: CancellationToken,
    _guard: DropGuard,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let (mut net_writer, mut net_reader) = Framed::new(stream, RelayCodec).split();
        let token = CancellationToken::new();

        // User -> Network
        let (user_tx, mut network_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

        // Network -> User
        let (network_tx, user_rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Writer task: frames already queued go out before a close takes effect
        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = network_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = net_writer.send(frame).await {
                            tracing::debug!(%peer, error = %e, "relay write failed");
                            break;
                        }
                    }
                    _ = writer_token.cancelled() => break,
                }
            }
            let _ = net_writer.close().await;
            writer_token.cancel();
        });

        // Reader task: Network -> User
        let reader_token = token.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = reader_token.cancelled() => break,
                    next = net_reader.next() => match next {
                        Some(result) => result,
                        None => break,
                    },
                };
                match result {
                    Ok(frame) if frame.method() == Method::Heartbeat => {
                        tracing::trace!(%peer, "heartbeat");
                    }
                    Ok(frame) => {
                        if network_tx.send(frame).await.is_err() {
                            // user side dropped its receiver
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "relay read failed");
                        break;
                    }
                }
            }
            reader_token.cancel();
        });

        // Heartbeat task
        let heartbeat_tx = user_tx.clone();
        let heartbeat_token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = heartbeat_token.cancelled() => break,
                    _ = interval.tick() => {
                        if heartbeat_tx.send(Frame::heartbeat()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            tx: user_tx,
            rx: user_rx,
            peer,
            _guard: token.clone().drop_guard(),
            token,
        })
    }

    pub async fn connect(info: &ConnectionInfo) -> Result<Self> {
        let stream = TcpStream::connect((info.ip(), info.port())).await?;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Next non-heartbeat frame, or `None` once the connection is down.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn sender(&self) -> ConnectionSender {
        self.tx.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// A token cancelled when the connection goes down for any reason.
    pub fn closed_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the background tasks after flushing queued frames.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Split into the outbound sender, the inbound receiver, and the
    /// guard that keeps the socket open.
    pub fn into_parts(self) -> (ConnectionSender, mpsc::Receiver<Frame>, DropGuard) {
        (self.tx, self.rx, self._guard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    ip: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `true` when the host part names this machine's loopback.
    pub fn is_loopback(&self) -> bool {
        if self.ip.eq_ignore_ascii_case("localhost") {
            return true;
        }
        self.ip
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
    }
}

impl From<SocketAddr> for ConnectionInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
