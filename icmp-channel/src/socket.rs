use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Type};

use crate::EndpointAddr;

/// The raw datagram transport underneath an [`IcmpChannel`](crate::IcmpChannel).
///
/// Implemented by [`OsSocket`] for real ICMPv6 sockets; tests substitute an
/// in-memory transport. Implementations must support concurrent use from
/// independent tasks.
#[async_trait]
pub trait PacketSocket: Send + Sync + 'static {
    /// Receives one datagram, returning its length and source address.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)>;

    /// Sends one datagram to `dst`.
    async fn send_to(&self, packet: &[u8], dst: IpAddr) -> io::Result<usize>;
}

/// An ICMPv6 socket bound to a local address.
pub struct OsSocket {
    inner: tokio::net::UdpSocket,
}

impl OsSocket {
    /// Opens an ICMPv6 socket bound to `local`.
    ///
    /// Raw ICMP typically requires elevated privileges; failures are
    /// surfaced unchanged. Must be called from within a tokio runtime.
    pub fn bind(local: &EndpointAddr) -> io::Result<Self> {
        let addr: SockAddr = local.socket_addr().into();

        let socket = icmpv6_socket()?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr)?;

        let socket = std::net::UdpSocket::from(socket);
        let socket = tokio::net::UdpSocket::try_from(socket)?;

        Ok(Self { inner: socket })
    }
}

#[async_trait]
impl PacketSocket for OsSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        let (len, from) = self.inner.recv_from(buf).await?;

        Ok((len, from.ip()))
    }

    async fn send_to(&self, packet: &[u8], dst: IpAddr) -> io::Result<usize> {
        // ICMP has no ports; the kernel ignores the zero.
        self.inner.send_to(packet, SocketAddr::new(dst, 0)).await
    }
}

/// Prefers a raw socket: the session filter needs to see inbound echo
/// *requests*, which the unprivileged ping socket never delivers. The ping
/// socket remains a fallback for unprivileged use on paths that rewrite
/// requests into replies.
#[cfg(unix)]
fn icmpv6_socket() -> io::Result<socket2::Socket> {
    match socket2::Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)) {
        Ok(socket) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            tracing::debug!("No raw socket privileges, falling back to ping socket");

            socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6))
        }
        Err(e) => Err(e),
    }
}

/// Windows has no ping sockets; only raw ICMPv6 exists.
#[cfg(windows)]
fn icmpv6_socket() -> io::Result<socket2::Socket> {
    socket2::Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
}
