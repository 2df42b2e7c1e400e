//! Datagram transport.
//!
//! A thin wrapper over a UDP socket. The only suspension point in a transfer
//! session is [`Endpoint::recv_deadline`]; there are no implicit socket
//! timeouts, callers always pass a deadline, and an elapsed deadline comes
//! back as a plain value because the state machine uses it to drive
//! retransmission.

use std::io;
use std::net::SocketAddr;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::{Instant, timeout_at};

pub struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::debug!("endpoint bound to {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    /// Bind a fresh OS-assigned port in the peer's address family. This is
    /// the transfer-ID handoff: the server answers a request received on the
    /// well-known port from a port of its own choosing.
    pub async fn bind_ephemeral(peer: SocketAddr) -> io::Result<Self> {
        let bind_addr = match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        Self::bind(bind_addr).await
    }

    pub async fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, peer).await?;
        Ok(())
    }

    /// Wait for a datagram until `deadline`. `Ok(None)` means the deadline
    /// elapsed with nothing received.
    pub async fn recv_deadline(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match timeout_at(deadline, self.socket.recv_from(buf)).await {
            Ok(Ok((len, from))) => Ok(Some((len, from))),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Wait for a datagram with no deadline. Only the request dispatcher
    /// listens like this; sessions always use [`Endpoint::recv_deadline`].
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
