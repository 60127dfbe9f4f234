// transport/socket.rs

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, time::Instant};
use tracing::trace;

use super::{EchoReply, EchoTransport};
use crate::error::{RelayError, TransmitError};
use crate::icmp::{self, IcmpPacket};

/// Receive buffer: an MTU-sized datagram plus a maximal IPv4 header.
const RECV_BUFFER_LEN: usize = 2048;

/// Raw IPv4 ICMP socket shared by every session of the agent.
///
/// Opening it needs `CAP_NET_RAW` (or root). The kernel hands every inbound
/// ICMP datagram to a raw socket, IP header included, which is where the
/// reply TTL comes from.
#[derive(Debug)]
pub struct RawSocketTransport {
    socket: UdpSocket,
}

impl RawSocketTransport {
    /// Opens the raw socket. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Permission`] if the process may not open raw
    /// sockets, [`RelayError::Io`] for any other socket failure.
    pub fn open() -> Result<Self, RelayError> {
        let socket = create_socket().map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => RelayError::Permission(e),
            _ => RelayError::Io(e),
        })?;

        Ok(Self { socket })
    }
}

#[async_trait]
impl EchoTransport for RawSocketTransport {
    async fn send_echo(
        &self,
        target: Ipv4Addr,
        identifier: u16,
        sequence: u16,
        payload_len: usize,
    ) -> Result<(), TransmitError> {
        let packet = IcmpPacket::echo_request_with_padding(identifier, sequence, payload_len);
        let target = SocketAddr::new(IpAddr::V4(target), 0);

        self.socket
            .send_to(packet.as_bytes(), target)
            .await
            .map_err(TransmitError::new)?;
        Ok(())
    }

    async fn recv_reply(&self) -> io::Result<EchoReply> {
        let mut buf = [0u8; RECV_BUFFER_LEN];

        loop {
            let (size, from) = self.socket.recv_from(&mut buf).await?;
            let arrived_at = Instant::now();

            match icmp::parse_ipv4_echo_reply(&buf[..size]) {
                Some(reply) => {
                    return Ok(EchoReply {
                        source: IpAddr::V4(reply.source),
                        identifier: reply.identifier,
                        sequence: reply.sequence,
                        ttl: reply.ttl,
                        arrived_at,
                    })
                }
                None => trace!(%from, size, "ignoring non echo-reply ICMP datagram"),
            }
        }
    }
}

fn create_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_recv_buffer_size(1 << 20);

    UdpSocket::from_std(socket.into())
}
