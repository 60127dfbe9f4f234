// agent/session.rs - one client's ping run on the shared transport

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{PingIntent, Relay};
use crate::correlator::{Correlator, PendingKey, PendingReply};
use crate::error::RelayError;
use crate::ident::{SessionId, SessionLease};
use crate::protocol::{PingResult, RelayMessage};
use crate::stats::{OutcomeLog, PacketOutcome, SessionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    /// Sending paced echo requests.
    Running,
    /// All requests sent, waiting for the outstanding ones to resolve.
    Draining,
    Completed,
    Cancelled,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Every request resolved; the summary was sent to the client.
    Completed(SessionSummary),
    /// The client went away. No summary is sent; the one carried here covers
    /// what had been sent and resolved up to that point.
    Cancelled(SessionSummary),
    /// The session could not go on; the error was sent to the client.
    Failed(RelayError),
}

/// Expires whatever the session still has in the shared table, however the
/// session ends (including a panic or the task being aborted).
struct SessionGuard {
    correlator: Arc<Correlator>,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let leaked = self.correlator.cancel_session(self.id);
        if leaked > 0 {
            warn!(session = %self.id, leaked, "expired requests left behind by session");
        }
    }
}

/// Drives one [`PingIntent`]: paced sends, per-request timeouts, one result
/// per resolved request and a final summary.
pub struct AgentSession {
    relay: Arc<Relay>,
    intent: PingIntent,
    log: OutcomeLog,
    state: SessionState,
    started_at: Instant,
    // dropped before the lease so the id is only recycled once the table is clean
    _guard: SessionGuard,
    lease: SessionLease,
}

impl AgentSession {
    /// Reserves a session id on `relay` and makes sure its reply router runs.
    pub fn start(relay: Arc<Relay>, intent: PingIntent) -> Result<Self, RelayError> {
        if let Some(reason) = relay.failure() {
            return Err(RelayError::TransportClosed(reason));
        }

        let lease = relay.ids().allocate().ok_or(RelayError::Busy)?;
        relay.ensure_router_running();

        let guard = SessionGuard {
            correlator: Arc::clone(relay.correlator()),
            id: lease.id(),
        };

        Ok(Self {
            relay,
            intent,
            log: OutcomeLog::new(),
            state: SessionState::Starting,
            started_at: Instant::now(),
            _guard: guard,
            lease,
        })
    }

    pub fn id(&self) -> SessionId {
        self.lease.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session to its end, writing `Result`, `Summary` and `Error`
    /// messages to `out`. Cancelling `cancel`, or dropping the receiving end
    /// of `out`, cancels the session.
    pub async fn run(
        self,
        out: mpsc::Sender<RelayMessage>,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let span = info_span!("session", id = %self.id(), target = %self.intent.target);
        self.drive(out, cancel).instrument(span).await
    }

    async fn drive(
        mut self,
        out: mpsc::Sender<RelayMessage>,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let mut in_flight = FuturesUnordered::new();
        let mut ticker = time::interval(self.intent.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence: u32 = 0;

        info!(
            host = %self.intent.host,
            count = ?self.intent.count,
            interval = ?self.intent.interval,
            timeout = ?self.intent.timeout,
            "session started"
        );
        self.transition(SessionState::Running);

        loop {
            let sending = self.intent.count.map_or(true, |count| sequence < count);
            if !sending {
                if in_flight.is_empty() {
                    break;
                }
                if self.state == SessionState::Running {
                    self.transition(SessionState::Draining);
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return self.cancel(in_flight).await;
                }

                Some((seq, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    if !self.emit(&out, seq, outcome).await {
                        return self.cancel(in_flight).await;
                    }
                }

                _ = ticker.tick(), if sending => {
                    sequence += 1;
                    match self.transmit(sequence).await {
                        Ok(pending) => {
                            in_flight.push(async move { (sequence, pending.settle().await) });
                        }
                        Err(err) => return self.fail(err, &out, in_flight).await,
                    }
                }
            }
        }

        self.complete(&out).await
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Registers and sends request `sequence`. A send that fails without
    /// taking the transport down resolves as `Lost` right away.
    async fn transmit(&mut self, sequence: u32) -> Result<PendingReply, RelayError> {
        if let Some(reason) = self.relay.failure() {
            return Err(RelayError::TransportClosed(reason));
        }

        let key = PendingKey::new(self.lease.id(), self.lease.next_sequence());
        let registered = self.relay.correlator().register(
            key,
            IpAddr::V4(self.intent.target),
            self.intent.timeout,
        );
        let pending = match registered {
            Ok(pending) => pending,
            Err(duplicate) => panic!("correlator invariant violated: {duplicate}"),
        };
        self.log.record_sent();

        let sent = self
            .relay
            .transport()
            .send_echo(
                self.intent.target,
                key.session.0,
                key.sequence,
                self.intent.payload_len,
            )
            .await;

        match sent {
            Ok(()) => {
                debug!(sequence, icmp_sequence = key.sequence, "echo request sent");
                Ok(pending)
            }
            Err(err) if err.is_fatal() => {
                self.relay.correlator().expire(key);
                Err(err.into())
            }
            Err(err) => {
                warn!(sequence, "{err}, counting as lost");
                self.relay.correlator().expire(key);
                Ok(pending)
            }
        }
    }

    /// Records an outcome and forwards it. `false` means the client is gone.
    async fn emit(
        &mut self,
        out: &mpsc::Sender<RelayMessage>,
        sequence: u32,
        outcome: PacketOutcome,
    ) -> bool {
        if self.log.record(sequence, outcome).is_none() {
            warn!(sequence, "sequence resolved twice, keeping the first outcome");
            return true;
        }
        debug!(sequence, ?outcome, "request resolved");

        out.send(RelayMessage::Result(PingResult { sequence, outcome }))
            .await
            .is_ok()
    }

    /// Expires everything still pending and records those outcomes locally.
    async fn abandon<F>(&mut self, mut in_flight: FuturesUnordered<F>) -> usize
    where
        F: Future<Output = (u32, PacketOutcome)>,
    {
        let expired = self.relay.correlator().cancel_session(self.lease.id());
        while let Some((sequence, outcome)) = in_flight.next().await {
            let _ = self.log.record(sequence, outcome);
        }
        expired
    }

    async fn cancel<F>(mut self, in_flight: FuturesUnordered<F>) -> SessionEnd
    where
        F: Future<Output = (u32, PacketOutcome)>,
    {
        self.transition(SessionState::Cancelled);
        let expired = self.abandon(in_flight).await;

        let summary = self.log.summary();
        info!(
            expired,
            tx = summary.tx,
            rx = summary.rx,
            elapsed = ?self.started_at.elapsed(),
            "session cancelled by client"
        );
        SessionEnd::Cancelled(summary)
    }

    async fn fail<F>(
        mut self,
        err: RelayError,
        out: &mpsc::Sender<RelayMessage>,
        in_flight: FuturesUnordered<F>,
    ) -> SessionEnd
    where
        F: Future<Output = (u32, PacketOutcome)>,
    {
        self.transition(SessionState::Cancelled);
        self.abandon(in_flight).await;

        warn!("session failed: {err}");
        let _ = out.send(RelayMessage::error(&err)).await;
        SessionEnd::Failed(err)
    }

    async fn complete(mut self, out: &mpsc::Sender<RelayMessage>) -> SessionEnd {
        self.transition(SessionState::Completed);

        let summary = self.log.summary();
        info!(
            tx = summary.tx,
            rx = summary.rx,
            lost = summary.lost,
            elapsed = ?self.started_at.elapsed(),
            "session completed"
        );

        let _ = out.send(RelayMessage::Summary(summary)).await;
        SessionEnd::Completed(summary)
    }
}
