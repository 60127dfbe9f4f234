//! Agent side of the relay: the shared raw transport with its reply router,
//! per-client ping sessions, and the control channel server.

use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use futures::StreamExt;
use tracing::{debug, error, trace};

use crate::correlator::Correlator;
use crate::ident::IdAllocator;
use crate::transport::{reply_stream, EchoTransport};

mod intent;
mod server;
mod session;

pub use intent::PingIntent;
pub use server::{serve_connection, AgentServer};
pub use session::{AgentSession, SessionEnd, SessionState};

/// Everything the sessions of one agent process share: the raw transport,
/// the correlator in front of it, and the session id pool.
///
/// The reply router (the only reader of the transport) is spawned on first
/// use and stopped when the relay is dropped.
pub struct Relay {
    transport: Arc<dyn EchoTransport>,
    correlator: Arc<Correlator>,
    ids: IdAllocator,
    failed: Arc<Mutex<Option<String>>>,
    router_abort: OnceLock<tokio::task::AbortHandle>,
}

impl Relay {
    pub fn new(transport: Arc<dyn EchoTransport>) -> Arc<Self> {
        Self::with_ids(transport, IdAllocator::new())
    }

    pub fn with_ids(transport: Arc<dyn EchoTransport>, ids: IdAllocator) -> Arc<Self> {
        Arc::new(Self {
            transport,
            correlator: Arc::new(Correlator::new()),
            ids,
            failed: Arc::new(Mutex::new(None)),
            router_abort: OnceLock::new(),
        })
    }

    pub fn transport(&self) -> &Arc<dyn EchoTransport> {
        &self.transport
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Why the reply router stopped, if it did. Once set the transport is
    /// unusable for the rest of the process.
    pub fn failure(&self) -> Option<String> {
        self.failed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Spawns the reply router unless it is already running.
    pub fn ensure_router_running(&self) {
        let transport = Arc::clone(&self.transport);
        let correlator = Arc::clone(&self.correlator);
        let failed = Arc::clone(&self.failed);

        self.router_abort.get_or_init(|| {
            let handle = tokio::spawn(reply_router_loop(transport, correlator, failed));
            handle.abort_handle()
        });
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(abort_handle) = self.router_abort.get() {
            abort_handle.abort();
        }
    }
}

async fn reply_router_loop(
    transport: Arc<dyn EchoTransport>,
    correlator: Arc<Correlator>,
    failed: Arc<Mutex<Option<String>>>,
) {
    let mut replies = reply_stream(transport);

    while let Some(next) = replies.next().await {
        match next {
            Ok(reply) => {
                match correlator.resolve(&reply) {
                    Some(session) => debug!(
                        %session,
                        sequence = reply.sequence,
                        source = %reply.source,
                        "echo reply matched"
                    ),
                    // late, duplicate, or someone else's ping
                    None => trace!(
                        identifier = reply.identifier,
                        sequence = reply.sequence,
                        source = %reply.source,
                        "echo reply without pending request"
                    ),
                }
            }
            Err(e) => match e.kind() {
                // Fatal errors - router cannot continue
                io::ErrorKind::PermissionDenied
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected => {
                    error!("raw transport failed, no more replies will be received: {e}");

                    *failed
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(e.to_string());

                    // pending requests must not wait for their timeouts
                    let expired = correlator.fail_all();
                    debug!(expired, "expired pending requests after transport failure");
                    return;
                }

                // temporary network issues and the like
                _ => debug!("transient receive error: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::time::{self, Instant};

    use crate::correlator::PendingKey;
    use crate::ident::SessionId;
    use crate::stats::PacketOutcome;
    use crate::test_util::LoopbackTransport;
    use crate::transport::EchoReply;

    #[tokio::test]
    async fn test_lazy_router_spawning() {
        let relay = Relay::new(Arc::new(LoopbackTransport::silent()));
        assert!(relay.router_abort.get().is_none());

        relay.ensure_router_running();
        assert!(relay.router_abort.get().is_some());

        // idempotent
        relay.ensure_router_running();
        assert!(relay.failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn router_resolves_and_ignores_foreign_replies() {
        let transport = Arc::new(LoopbackTransport::silent());
        let relay = Relay::new(transport.clone());
        relay.ensure_router_running();

        let target = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50));
        let pending = relay
            .correlator()
            .register(PendingKey::new(SessionId(7), 1), target, Duration::from_secs(1))
            .unwrap();

        let reply = |source, identifier, sequence| EchoReply {
            source,
            identifier,
            sequence,
            ttl: 61,
            arrived_at: Instant::now(),
        };
        transport.inject(reply(target, 99, 1));
        transport.inject(reply(target, 7, 2));
        transport.inject(reply(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 7, 1));
        transport.inject(reply(target, 7, 1));

        let outcome = pending.settle().await;
        assert!(matches!(outcome, PacketOutcome::Replied { ttl: 61, .. }));
        assert_eq!(relay.correlator().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_receive_error_fails_pending_requests() {
        let transport = Arc::new(LoopbackTransport::silent());
        let relay = Relay::new(transport.clone());
        relay.ensure_router_running();

        let pending = relay
            .correlator()
            .register(
                PendingKey::new(SessionId(1), 1),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                Duration::from_secs(30),
            )
            .unwrap();
        transport.inject_error(io::ErrorKind::WouldBlock);
        transport.inject_error(io::ErrorKind::PermissionDenied);

        let started = Instant::now();
        let outcome = pending.settle().await;

        assert_eq!(outcome, PacketOutcome::Lost);
        assert!(started.elapsed() < Duration::from_secs(30));
        time::sleep(Duration::from_millis(1)).await;
        assert!(relay.failure().is_some());
    }
}
