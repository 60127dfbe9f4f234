// ident.rs - session identifiers and per-session sequence numbers

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::random;

/// Identifies a live session on the shared raw transport.
///
/// The value travels as the ICMP echo identifier, so it is 16 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Hands out session ids that are unique among live sessions.
///
/// Ids are returned to the pool when the [`SessionLease`] is dropped, so a
/// long-running agent recycles them. Allocation starts at a random offset so
/// that two agents on one host are unlikely to pick the same identifiers.
#[derive(Clone)]
pub struct IdAllocator {
    inner: Arc<Mutex<AllocatorState>>,
}

struct AllocatorState {
    live: HashSet<u16>,
    next: u16,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(random())
    }

    pub fn starting_at(first: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AllocatorState {
                live: HashSet::new(),
                next: first,
            })),
        }
    }

    /// Reserves a fresh session id, or `None` when all 65536 are in use.
    pub fn allocate(&self) -> Option<SessionLease> {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.live.len() > u16::MAX as usize {
            return None;
        }

        let mut candidate = state.next;
        while state.live.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        state.live.insert(candidate);
        state.next = candidate.wrapping_add(1);

        Some(SessionLease {
            id: SessionId(candidate),
            next_sequence: 1,
            allocator: Arc::clone(&self.inner),
        })
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .live
            .len()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of one session id, plus that session's sequence counter.
pub struct SessionLease {
    id: SessionId,
    next_sequence: u16,
    allocator: Arc<Mutex<AllocatorState>>,
}

impl SessionLease {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next ICMP sequence number for this session: 1, 2, ... 65535, 0, 1, ...
    ///
    /// A wrapped value cannot collide with a pending request as long as the
    /// older request has already been resolved and removed from the correlator.
    pub fn next_sequence(&mut self) -> u16 {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        sequence
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.allocator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .live
            .remove(&self.id.0);
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_while_live() {
        let allocator = IdAllocator::starting_at(10);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        let c = allocator.allocate().unwrap();

        assert_eq!(a.id(), SessionId(10));
        assert_eq!(b.id(), SessionId(11));
        assert_eq!(c.id(), SessionId(12));
        assert_eq!(allocator.live_count(), 3);
    }

    #[test]
    fn ids_are_recycled_after_release() {
        let allocator = IdAllocator::starting_at(u16::MAX);
        let first = allocator.allocate().unwrap();
        assert_eq!(first.id(), SessionId(u16::MAX));

        let second = allocator.allocate().unwrap();
        assert_eq!(second.id(), SessionId(0));

        drop(first);
        assert_eq!(allocator.live_count(), 1);

        // a released id is only reused once the cursor comes back around
        let allocator = IdAllocator::starting_at(5);
        let held = allocator.allocate().unwrap();
        drop(held);
        let again = allocator.allocate().unwrap();
        assert_eq!(again.id(), SessionId(6));
        assert_eq!(allocator.live_count(), 1);
    }

    #[test]
    fn allocation_skips_live_ids() {
        let allocator = IdAllocator::starting_at(0);
        let zero = allocator.allocate().unwrap();
        let one = allocator.allocate().unwrap();
        drop(zero);

        {
            let mut state = allocator.inner.lock().unwrap();
            state.next = 1;
        }
        let next = allocator.allocate().unwrap();
        assert_eq!(next.id(), SessionId(2));
        assert_ne!(next.id(), one.id());
    }

    #[test]
    fn sequences_start_at_one_and_wrap() {
        let allocator = IdAllocator::starting_at(0);
        let mut lease = allocator.allocate().unwrap();

        assert_eq!(lease.next_sequence(), 1);
        assert_eq!(lease.next_sequence(), 2);

        lease.next_sequence = u16::MAX;
        assert_eq!(lease.next_sequence(), u16::MAX);
        assert_eq!(lease.next_sequence(), 0);
        assert_eq!(lease.next_sequence(), 1);
    }
}
