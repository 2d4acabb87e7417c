//! UDP socket setup shared by the advertiser and the prober.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Create a UDP socket bound to `port` on all IPv4 interfaces with
/// address reuse enabled, so several announcers (and a prober) can share
/// the discovery port on one machine.
pub fn create_reusable_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;

    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Bind a reusable socket and hand it to tokio.
///
/// Enabling broadcast is best-effort: some sandboxed or NAT'd hosts
/// refuse it, in which case only unicast probes get through.
pub fn bind_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::from_std(create_reusable_socket(port)?)?;
    if let Err(e) = socket.set_broadcast(true) {
        tracing::warn!(port, error = %e, "could not enable UDP broadcast");
    }
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_sockets_share_a_port() {
        let first = bind_udp(0).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = bind_udp(port);
        assert!(second.is_ok());
    }
}
