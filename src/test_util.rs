//! In-memory stand-ins for the raw transport.
//!
//! These live in the regular (non-`#[cfg(test)]`) code so that integration
//! tests and embedders can drive a [`Relay`](crate::agent::Relay) without raw
//! socket privileges.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{self, Instant};

use crate::error::TransmitError;
use crate::transport::{EchoReply, EchoTransport};

/// An echo request handed to a [`LoopbackTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentEcho {
    pub target: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub payload_len: usize,
    pub sent_at: Instant,
}

/// What the simulated network does with one echo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// The target answers after `delay` with the given TTL.
    Reply { delay: Duration, ttl: u8 },
    /// The request (or its reply) vanishes.
    Drop,
    /// `send_echo` itself fails with this error kind.
    FailSend(io::ErrorKind),
}

type Script = Box<dyn FnMut(&SentEcho) -> Behaviour + Send>;

/// Scripted, in-memory [`EchoTransport`].
///
/// Each send is recorded and passed to the script, which decides whether and
/// when a reply shows up on the receive side.
pub struct LoopbackTransport {
    script: Mutex<Script>,
    sent: Mutex<Vec<SentEcho>>,
    inbox_tx: mpsc::UnboundedSender<io::Result<EchoReply>>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<io::Result<EchoReply>>>,
}

impl LoopbackTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: FnMut(&SentEcho) -> Behaviour + Send + 'static,
    {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(Box::new(script)),
            sent: Mutex::new(Vec::new()),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
        }
    }

    /// Every request is answered after `delay`.
    pub fn replying(delay: Duration) -> Self {
        Self::new(move |_| Behaviour::Reply { delay, ttl: 64 })
    }

    /// Nothing ever comes back.
    pub fn silent() -> Self {
        Self::new(|_| Behaviour::Drop)
    }

    /// Pushes an arbitrary reply onto the receive side, as if some other
    /// host or process had produced it.
    pub fn inject(&self, reply: EchoReply) {
        let _ = self.inbox_tx.send(Ok(reply));
    }

    /// Makes the next receive fail with `kind`.
    pub fn inject_error(&self, kind: io::ErrorKind) {
        let _ = self.inbox_tx.send(Err(io::Error::from(kind)));
    }

    pub fn sent(&self) -> Vec<SentEcho> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl EchoTransport for LoopbackTransport {
    async fn send_echo(
        &self,
        target: Ipv4Addr,
        identifier: u16,
        sequence: u16,
        payload_len: usize,
    ) -> Result<(), TransmitError> {
        let echo = SentEcho {
            target,
            identifier,
            sequence,
            payload_len,
            sent_at: Instant::now(),
        };

        let behaviour = {
            let mut script = self
                .script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (*script)(&echo)
        };
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(echo);

        match behaviour {
            Behaviour::Reply { delay, ttl } => {
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    let _ = inbox.send(Ok(EchoReply {
                        source: IpAddr::V4(target),
                        identifier,
                        sequence,
                        ttl,
                        arrived_at: Instant::now(),
                    }));
                });
                Ok(())
            }
            Behaviour::Drop => Ok(()),
            Behaviour::FailSend(kind) => Err(TransmitError::new(io::Error::from(kind))),
        }
    }

    async fn recv_reply(&self) -> io::Result<EchoReply> {
        let mut inbox = self.inbox_rx.lock().await;
        match inbox.recv().await {
            Some(reply) => reply,
            // unreachable while `self` holds the sender
            None => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
        }
    }
}
