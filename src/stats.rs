// stats.rs - per-packet outcomes and the statistics derived from them

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How one echo request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// A matching echo reply arrived before the timeout.
    Replied { ttl: u8, rtt: Duration },
    /// No reply arrived before the timeout, or the request never left.
    Lost,
}

impl PacketOutcome {
    /// A reply outcome with the RTT truncated to whole microseconds, the
    /// resolution carried on the control channel. Both ends therefore derive
    /// identical statistics from the same outcomes.
    pub fn replied(ttl: u8, rtt: Duration) -> Self {
        let micros = rtt.as_micros().min(u32::MAX as u128) as u64;
        PacketOutcome::Replied {
            ttl,
            rtt: Duration::from_micros(micros),
        }
    }

    pub fn is_replied(&self) -> bool {
        matches!(self, PacketOutcome::Replied { .. })
    }
}

/// Min/max/avg round trip over the replied packets of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttStats {
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

/// Aggregate view over a session's outcomes. Never mutated on its own;
/// recompute it from the outcomes instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    pub tx: u32,
    pub rx: u32,
    pub lost: u32,
    pub loss_pct: f64,
    /// `None` when no packet was answered.
    pub rtt: Option<RttStats>,
}

impl SessionSummary {
    pub fn from_outcomes<'a, I>(tx: u32, outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a PacketOutcome>,
    {
        let mut totals = Totals::default();
        for outcome in outcomes {
            totals.add(outcome);
        }
        totals.summary(tx)
    }
}

/// Running aggregates over resolved outcomes.
#[derive(Debug, Clone, Copy)]
struct Totals {
    rx: u32,
    lost: u32,
    min: Duration,
    max: Duration,
    total_micros: u128,
}

impl Default for Totals {
    fn default() -> Self {
        Self {
            rx: 0,
            lost: 0,
            min: Duration::MAX,
            max: Duration::ZERO,
            total_micros: 0,
        }
    }
}

impl Totals {
    fn add(&mut self, outcome: &PacketOutcome) {
        match *outcome {
            PacketOutcome::Replied { rtt, .. } => {
                self.rx += 1;
                self.min = self.min.min(rtt);
                self.max = self.max.max(rtt);
                self.total_micros += rtt.as_micros();
            }
            PacketOutcome::Lost => self.lost += 1,
        }
    }

    fn resolved(&self) -> usize {
        self.rx as usize + self.lost as usize
    }

    fn summary(&self, tx: u32) -> SessionSummary {
        let rtt = (self.rx > 0).then(|| RttStats {
            min: self.min,
            max: self.max,
            avg: Duration::from_micros((self.total_micros / self.rx as u128) as u64),
        });

        SessionSummary {
            tx,
            rx: self.rx,
            lost: self.lost,
            loss_pct: loss_percentage(self.lost, tx),
            rtt,
        }
    }
}

/// `lost / tx * 100`, defined as 0 when nothing was sent.
pub fn loss_percentage(lost: u32, tx: u32) -> f64 {
    if tx == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / tx as f64
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets tx, {} rx, {} lost, {:.1}% packets loss",
            self.tx, self.rx, self.lost, self.loss_pct
        )?;

        if let Some(rtt) = self.rtt {
            write!(
                f,
                "\nrtt min/max/avg {:.3}/{:.3}/{:.3} ms",
                millis(rtt.min),
                millis(rtt.max),
                millis(rtt.avg)
            )?;
        }
        Ok(())
    }
}

/// Outcomes of one session, whatever order they resolved in.
///
/// Keeps running totals plus the outcomes that resolved ahead of a lower,
/// still outstanding sequence number; everything below the first gap is
/// folded into the totals. Sequence numbers start at 1.
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    sent: u32,
    totals: Totals,
    /// Lowest sequence number not resolved yet.
    next: u32,
    /// Resolved sequences above `next`.
    ahead: BTreeMap<u32, PacketOutcome>,
}

impl Default for OutcomeLog {
    fn default() -> Self {
        Self {
            sent: 0,
            totals: Totals::default(),
            next: 1,
            ahead: BTreeMap::new(),
        }
    }
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more transmitted request.
    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    /// Stores the outcome for `sequence`.
    ///
    /// Returns the outcomes that are now in order: `sequence` itself and any
    /// parked successors, or nothing while a lower sequence is still
    /// outstanding. Returns `None` (and keeps the first outcome) if that
    /// sequence was already resolved.
    pub fn record(
        &mut self,
        sequence: u32,
        outcome: PacketOutcome,
    ) -> Option<Vec<(u32, PacketOutcome)>> {
        if sequence < self.next || self.ahead.contains_key(&sequence) {
            return None;
        }
        self.totals.add(&outcome);
        self.ahead.insert(sequence, outcome);

        let mut in_order = Vec::new();
        while let Some(outcome) = self.ahead.remove(&self.next) {
            in_order.push((self.next, outcome));
            self.next += 1;
        }
        Some(in_order)
    }

    /// Releases everything still parked behind a gap, in sequence order.
    pub fn drain_parked(&mut self) -> Vec<(u32, PacketOutcome)> {
        std::mem::take(&mut self.ahead).into_iter().collect()
    }

    pub fn resolved(&self) -> usize {
        self.totals.resolved()
    }

    /// Outcomes waiting for a lower sequence to resolve.
    pub fn parked(&self) -> usize {
        self.ahead.len()
    }

    /// Requests sent but not yet resolved.
    pub fn outstanding(&self) -> usize {
        (self.sent as usize).saturating_sub(self.resolved())
    }

    pub fn summary(&self) -> SessionSummary {
        self.totals.summary(self.sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[rstest]
    #[case::nothing_sent(0, 0, 0.0)]
    #[case::all_lost(4, 4, 100.0)]
    #[case::none_lost(4, 0, 0.0)]
    #[case::half(4, 2, 50.0)]
    #[case::third(3, 1, 100.0 / 3.0)]
    fn loss_percentage_cases(#[case] tx: u32, #[case] lost: u32, #[case] expected: f64) {
        assert!((loss_percentage(lost, tx) - expected).abs() < 1e-9);
    }

    #[test]
    fn summary_over_mixed_outcomes() {
        let outcomes = [
            PacketOutcome::replied(64, ms(10)),
            PacketOutcome::Lost,
            PacketOutcome::replied(64, ms(30)),
            PacketOutcome::replied(63, ms(20)),
        ];

        let summary = SessionSummary::from_outcomes(4, &outcomes);

        assert_eq!(summary.tx, 4);
        assert_eq!(summary.rx, 3);
        assert_eq!(summary.lost, 1);
        assert_eq!(summary.loss_pct, 25.0);
        assert_eq!(
            summary.rtt,
            Some(RttStats {
                min: ms(10),
                max: ms(30),
                avg: ms(20)
            })
        );
    }

    #[test]
    fn rtt_undefined_when_everything_lost() {
        let outcomes = [PacketOutcome::Lost; 4];
        let summary = SessionSummary::from_outcomes(4, &outcomes);

        assert_eq!(summary.rx, 0);
        assert_eq!(summary.lost, 4);
        assert_eq!(summary.loss_pct, 100.0);
        assert_eq!(summary.rtt, None);
        assert_eq!(
            summary.to_string(),
            "4 packets tx, 0 rx, 4 lost, 100.0% packets loss"
        );
    }

    #[test]
    fn replied_truncates_to_micros() {
        let outcome = PacketOutcome::replied(1, Duration::from_nanos(1_234_567));
        assert_eq!(
            outcome,
            PacketOutcome::Replied {
                ttl: 1,
                rtt: Duration::from_micros(1_234)
            }
        );
    }

    #[test]
    fn display_includes_rtt_line() {
        let outcomes = [PacketOutcome::replied(64, Duration::from_micros(1_500))];
        let summary = SessionSummary::from_outcomes(1, &outcomes);

        assert_eq!(
            summary.to_string(),
            "1 packets tx, 1 rx, 0 lost, 0.0% packets loss\nrtt min/max/avg 1.500/1.500/1.500 ms"
        );
    }

    #[test]
    fn log_releases_outcomes_in_sequence_order() {
        let mut log = OutcomeLog::new();
        for _ in 0..3 {
            log.record_sent();
        }
        assert_eq!(log.outstanding(), 3);

        assert_eq!(log.record(3, PacketOutcome::replied(64, ms(1))), Some(vec![]));
        assert_eq!(log.record(1, PacketOutcome::Lost), Some(vec![(1, PacketOutcome::Lost)]));
        assert_eq!(log.parked(), 1);

        let released = log.record(2, PacketOutcome::replied(64, ms(2))).unwrap();
        let order: Vec<u32> = released.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(order, vec![2, 3]);
        assert_eq!(log.parked(), 0);
        assert_eq!(log.outstanding(), 0);

        // first outcome wins, released or still parked
        assert_eq!(log.record(1, PacketOutcome::replied(64, ms(9))), None);
        assert_eq!(log.record(0, PacketOutcome::Lost), None);

        let summary = log.summary();
        assert_eq!((summary.tx, summary.rx, summary.lost), (3, 2, 1));
        assert_eq!(summary.rtt.map(|rtt| rtt.max), Some(ms(2)));
    }

    #[test]
    fn log_only_keeps_the_reorder_window() {
        let mut log = OutcomeLog::new();
        for seq in 1..=10_000u32 {
            log.record_sent();
            if seq % 100 != 0 {
                log.record(seq, PacketOutcome::replied(64, ms(1))).unwrap();
            }
            // every hundredth request resolves a little late
            if seq % 100 == 2 && seq > 100 {
                log.record(seq - 2, PacketOutcome::Lost).unwrap();
            }
            assert!(log.parked() <= 2, "parked {} at {seq}", log.parked());
        }

        let tail = log.drain_parked();
        assert!(tail.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert_eq!(log.summary().lost, 99);
    }
}
