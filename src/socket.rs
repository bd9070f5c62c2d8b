//! The datagram socket seam.
//!
//! The engine only ever talks to [`DatagramSocket`], introduced to facilitate
//!  mocking the I/O part away for testing and to let tests interpose loss or
//!  reordering filters between two multiplexers.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Fire-and-forget send. Never blocks and never reports failure to the
    ///  caller - a datagram that could not be handed to the kernel is simply
    ///  lost, and the ARQ layer's retransmission repairs it.
    fn send_datagram(&self, buf: &[u8], to: SocketAddr);

    /// Await the next datagram. May suspend indefinitely.
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    fn send_datagram(&self, buf: &[u8], to: SocketAddr) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        match self.try_send_to(buf, to) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("kernel send buffer full - dropping packet to {:?}, retransmission repairs", to);
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a UDP socket for the multiplexer, optionally with `SO_REUSEADDR` (which
///  plain tokio binding does not expose). Must be called from within a tokio
///  runtime.
pub fn bind_udp(addr: SocketAddr, reuse_addr: bool) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
