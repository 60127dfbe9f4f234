// correlator.rs - matching inbound echo replies to outstanding requests

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};

use crate::error::DuplicateKey;
use crate::ident::SessionId;
use crate::stats::PacketOutcome;
use crate::transport::EchoReply;

/// Key of an outstanding request on the shared transport: the ICMP
/// identifier (the session id) plus the ICMP sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub session: SessionId,
    pub sequence: u16,
}

impl PendingKey {
    pub fn new(session: SessionId, sequence: u16) -> Self {
        Self { session, sequence }
    }
}

struct PendingEntry {
    /// Only replies from this address count.
    target: IpAddr,
    sent_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<PacketOutcome>,
    expiry: AbortHandle,
}

impl PendingEntry {
    fn complete(self, outcome: PacketOutcome) {
        self.expiry.abort();
        // the receiving half may be gone if the session was torn down
        let _ = self.slot.send(outcome);
    }
}

type Table = Mutex<HashMap<PendingKey, PendingEntry>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<PendingKey, PendingEntry>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Table of outstanding echo requests shared by every session of an agent.
///
/// Each entry is removed by exactly one of [`resolve`](Self::resolve), its
/// own expiry timer, [`expire`](Self::expire),
/// [`cancel_session`](Self::cancel_session) or [`fail_all`](Self::fail_all).
/// Whoever removes the entry completes its slot, so a reply racing with its
/// own timeout produces a single outcome.
#[derive(Default)]
pub struct Correlator {
    registry: Arc<Table>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingEntry>> {
        lock(&self.registry)
    }

    /// Inserts a fresh pending request for an echo sent to `target`, stamped
    /// with the current time, and arms its expiry timer.
    ///
    /// The timer runs on its own task, so the request turns `Lost` at
    /// `sent_at + timeout` whether or not anyone is polling the returned
    /// [`PendingReply`]. Must be called from within a Tokio runtime, right
    /// before handing the echo request to the transport.
    pub fn register(
        &self,
        key: PendingKey,
        target: IpAddr,
        timeout: Duration,
    ) -> Result<PendingReply, DuplicateKey> {
        use std::collections::hash_map::Entry;

        let sent_at = Instant::now();
        let deadline = sent_at + timeout;

        let mut table = self.table();
        let vacant = match table.entry(key) {
            Entry::Occupied(_) => return Err(DuplicateKey(key)),
            Entry::Vacant(vacant) => vacant,
        };

        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let expiry = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(entry) = lock(&registry).remove(&key) {
                let _ = entry.slot.send(PacketOutcome::Lost);
            }
        });

        vacant.insert(PendingEntry {
            target,
            sent_at,
            deadline,
            slot: tx,
            expiry: expiry.abort_handle(),
        });
        Ok(PendingReply { key, sent_at, rx })
    }

    /// Completes the request matching an inbound reply, if it is still pending.
    ///
    /// Late, duplicate and foreign replies find nothing and are ignored. So is
    /// a reply with the right identifier and sequence from the wrong host. A
    /// reply that arrived after the deadline (its timer not having run yet)
    /// expires the request instead of answering it.
    pub fn resolve(&self, reply: &EchoReply) -> Option<SessionId> {
        let key = PendingKey::new(SessionId(reply.identifier), reply.sequence);

        let entry = {
            let mut table = self.table();
            let from_target = table
                .get(&key)
                .is_some_and(|entry| entry.target == reply.source);
            if !from_target {
                return None;
            }
            table.remove(&key)?
        };

        if reply.arrived_at > entry.deadline {
            entry.complete(PacketOutcome::Lost);
            return None;
        }

        let rtt = reply.arrived_at.saturating_duration_since(entry.sent_at);
        entry.complete(PacketOutcome::replied(reply.ttl, rtt));
        Some(key.session)
    }

    /// Marks a request as lost ahead of its deadline, if no reply claimed it
    /// first.
    ///
    /// Returns `false` when the entry was already gone.
    pub fn expire(&self, key: PendingKey) -> bool {
        let removed = self.table().remove(&key);
        match removed {
            Some(entry) => {
                entry.complete(PacketOutcome::Lost);
                true
            }
            None => false,
        }
    }

    /// Expires every outstanding request of `session`, returning how many there were.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let removed: Vec<PendingEntry> = {
            let mut table = self.table();
            let keys: Vec<PendingKey> = table
                .keys()
                .filter(|key| key.session == session)
                .copied()
                .collect();
            keys.iter().filter_map(|key| table.remove(key)).collect()
        };

        let count = removed.len();
        for entry in removed {
            entry.complete(PacketOutcome::Lost);
        }
        count
    }

    /// Expires everything; used when the transport died under all sessions.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.table().drain().map(|(_, entry)| entry).collect();

        let count = drained.len();
        for entry in drained {
            entry.complete(PacketOutcome::Lost);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    pub fn pending_for(&self, session: SessionId) -> usize {
        self.table()
            .keys()
            .filter(|key| key.session == session)
            .count()
    }
}

/// The session's half of a registered request.
#[derive(Debug)]
pub struct PendingReply {
    key: PendingKey,
    sent_at: Instant,
    rx: oneshot::Receiver<PacketOutcome>,
}

impl PendingReply {
    pub fn key(&self) -> PendingKey {
        self.key
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// Waits for the outcome: the matching reply, or `Lost` once the expiry
    /// timer (or a cancellation) got to the entry first.
    pub async fn settle(self) -> PacketOutcome {
        self.rx.await.unwrap_or(PacketOutcome::Lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    use rand::seq::SliceRandom;

    const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50));

    fn key(session: u16, sequence: u16) -> PendingKey {
        PendingKey::new(SessionId(session), sequence)
    }

    fn register(correlator: &Correlator, k: PendingKey) -> PendingReply {
        correlator
            .register(k, TARGET, Duration::from_secs(1))
            .unwrap()
    }

    fn reply(k: PendingKey, ttl: u8) -> EchoReply {
        EchoReply {
            source: TARGET,
            identifier: k.session.0,
            sequence: k.sequence,
            ttl,
            arrived_at: Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_completes_with_rtt() {
        let correlator = Correlator::new();
        let pending = register(&correlator, key(1, 1));

        time::advance(Duration::from_millis(12)).await;
        let matched = correlator.resolve(&reply(key(1, 1), 60));

        assert_eq!(matched, Some(SessionId(1)));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(
            pending.settle().await,
            PacketOutcome::Replied {
                ttl: 60,
                rtt: Duration::from_millis(12)
            }
        );
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let correlator = Correlator::new();
        let _first = register(&correlator, key(1, 5));

        assert_eq!(
            correlator
                .register(key(1, 5), TARGET, Duration::from_secs(1))
                .unwrap_err(),
            DuplicateKey(key(1, 5))
        );
        assert!(correlator
            .register(key(2, 5), TARGET, Duration::from_secs(1))
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_replies_are_noops() {
        let correlator = Correlator::new();
        let _pending = register(&correlator, key(1, 1));

        assert_eq!(correlator.resolve(&reply(key(1, 2), 64)), None);
        assert_eq!(correlator.resolve(&reply(key(9, 1), 64)), None);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn reply_from_another_host_is_ignored() {
        let correlator = Correlator::new();
        let pending = register(&correlator, key(1, 1));

        let spoofed = EchoReply {
            source: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            ..reply(key(1, 1), 64)
        };
        assert_eq!(correlator.resolve(&spoofed), None);
        assert_eq!(correlator.pending_count(), 1);

        assert_eq!(correlator.resolve(&reply(key(1, 1), 64)), Some(SessionId(1)));
        assert!(pending.settle().await.is_replied());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_without_anyone_waiting() {
        let correlator = Correlator::new();
        let pending = correlator
            .register(key(3, 1), TARGET, Duration::from_millis(500))
            .unwrap();

        // nobody polls `pending` while the deadline passes
        time::sleep(Duration::from_millis(700)).await;
        assert_eq!(correlator.pending_count(), 0);

        assert_eq!(correlator.resolve(&reply(key(3, 1), 64)), None);
        assert!(!correlator.expire(key(3, 1)));
        assert_eq!(pending.settle().await, PacketOutcome::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_past_deadline_counts_as_lost() {
        let correlator = Correlator::new();
        let pending = correlator
            .register(key(3, 2), TARGET, Duration::from_millis(500))
            .unwrap();

        // stamped after the deadline, delivered before the timer ran
        let late = EchoReply {
            arrived_at: Instant::now() + Duration::from_millis(501),
            ..reply(key(3, 2), 64)
        };
        assert_eq!(correlator.resolve(&late), None);
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(pending.settle().await, PacketOutcome::Lost);
    }

    #[tokio::test]
    async fn resolve_and_expire_have_one_winner() {
        let correlator = Correlator::new();
        let pending = register(&correlator, key(4, 1));

        assert!(correlator.resolve(&reply(key(4, 1), 64)).is_some());
        assert!(!correlator.expire(key(4, 1)));
        assert!(pending.settle().await.is_replied());

        let pending = register(&correlator, key(4, 2));
        assert!(correlator.expire(key(4, 2)));
        assert_eq!(correlator.resolve(&reply(key(4, 2), 64)), None);
        assert_eq!(pending.settle().await, PacketOutcome::Lost);
    }

    #[tokio::test]
    async fn cancel_session_only_touches_that_session() {
        let correlator = Correlator::new();
        let mine: Vec<_> = (1..=3).map(|seq| register(&correlator, key(1, seq))).collect();
        let _theirs = register(&correlator, key(2, 1));

        assert_eq!(correlator.cancel_session(SessionId(1)), 3);
        assert_eq!(correlator.pending_for(SessionId(1)), 0);
        assert_eq!(correlator.pending_for(SessionId(2)), 1);

        for pending in mine {
            assert_eq!(pending.settle().await, PacketOutcome::Lost);
        }
    }

    #[tokio::test]
    async fn fail_all_drains_the_table() {
        let correlator = Correlator::new();
        let _a = register(&correlator, key(1, 1));
        let _b = register(&correlator, key(2, 1));

        assert_eq!(correlator.fail_all(), 2);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_shuffled_resolve() {
        let correlator = Arc::new(Correlator::new());

        let mut registrations = Vec::new();
        for session in 0..5u16 {
            let correlator = Arc::clone(&correlator);
            registrations.push(tokio::spawn(async move {
                (1..=20u16)
                    .map(|seq| register(&correlator, key(session, seq)))
                    .collect::<Vec<_>>()
            }));
        }

        let mut pending = Vec::new();
        for handle in registrations {
            pending.extend(handle.await.unwrap());
        }
        assert_eq!(correlator.pending_count(), 100);

        let mut keys: Vec<PendingKey> = pending.iter().map(PendingReply::key).collect();
        keys.shuffle(&mut rand::thread_rng());

        let mut resolvers = Vec::new();
        for chunk in keys.chunks(10) {
            let correlator = Arc::clone(&correlator);
            let chunk = chunk.to_vec();
            resolvers.push(tokio::spawn(async move {
                chunk
                    .into_iter()
                    .filter(|k| correlator.resolve(&reply(*k, 64)) == Some(k.session))
                    .count()
            }));
        }

        let mut resolved = 0;
        for handle in resolvers {
            resolved += handle.await.unwrap();
        }
        assert_eq!(resolved, 100);
        assert_eq!(correlator.pending_count(), 0);

        // a second pass resolves nothing
        for k in &keys {
            assert_eq!(correlator.resolve(&reply(*k, 64)), None);
        }

        let mut seen = HashSet::new();
        for pending in pending {
            assert!(seen.insert(pending.key()));
            assert!(pending.settle().await.is_replied());
        }
        assert_eq!(seen.len(), 100);
    }
}
