// transport/mod.rs - the raw echo transport seam

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use tokio::time::Instant;

use crate::error::TransmitError;

mod socket;
pub use socket::RawSocketTransport;

/// One echo reply pulled off the raw transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub source: IpAddr,
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: u8,
    pub arrived_at: Instant,
}

/// Sends ICMP echo requests and receives echo replies on one shared socket.
///
/// `send_echo` may be called concurrently by many sessions. `recv_reply` is
/// meant to have a single caller, the reply router; it only returns echo
/// replies and silently skips any other ICMP traffic the socket sees.
#[async_trait]
pub trait EchoTransport: Send + Sync {
    async fn send_echo(
        &self,
        target: Ipv4Addr,
        identifier: u16,
        sequence: u16,
        payload_len: usize,
    ) -> Result<(), TransmitError>;

    async fn recv_reply(&self) -> io::Result<EchoReply>;
}

/// Endless stream of replies from `transport`.
///
/// The stream owns its handle on the transport and cannot be restarted once
/// dropped; create it once per transport and keep it in the router task.
pub fn reply_stream(transport: Arc<dyn EchoTransport>) -> BoxStream<'static, io::Result<EchoReply>> {
    Box::pin(stream::unfold(transport, |transport| async move {
        let next = transport.recv_reply().await;
        Some((next, transport))
    }))
}
