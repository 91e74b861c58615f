use crate::peers::pool::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-peer failure accounting.
///
/// Owned and mutated exclusively by the scheduler loop; other components
/// observe it through [`PeerReputationTracker::snapshot`].
#[derive(Debug, Default)]
struct PeerRecord {
    consecutive_failures: u32,
    banned_until: Option<Instant>,
    successes: u64,
    failures: u64,
    mismatches: u64,
    last_error: Option<String>,
}

impl PeerRecord {
    fn is_banned_at(&self, now: Instant) -> bool {
        self.banned_until.map(|until| now < until).unwrap_or(false)
    }
}

/// Outcome of recording a failure against a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanDecision {
    /// The peer stays eligible.
    Tolerated,
    /// The peer crossed the failure threshold and is now banned.
    Banned,
}

#[derive(Debug, Clone)]
pub struct PeerReputationDump {
    pub peer: PeerId,
    pub is_banned: bool,
    pub ban_remaining: Option<Duration>,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub failures: u64,
    pub mismatches: u64,
    pub last_error: Option<String>,
}

/// Tracks failures and timed bans for the peers the scheduler has seen.
#[derive(Debug)]
pub struct PeerReputationTracker {
    failure_threshold: u32,
    ban_cooldown: Duration,
    records: HashMap<PeerId, PeerRecord>,
}

impl PeerReputationTracker {
    pub fn new(failure_threshold: u32, ban_cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            ban_cooldown,
            records: HashMap::new(),
        }
    }

    pub fn record_success(&mut self, peer: PeerId) {
        let entry = self.records.entry(peer).or_default();
        entry.successes = entry.successes.saturating_add(1);
        entry.consecutive_failures = 0;
        entry.banned_until = None;
    }

    /// Records a transport-level failure; bans the peer once the consecutive
    /// failure count crosses the threshold.
    pub fn record_failure(&mut self, peer: PeerId, error: &str) -> BanDecision {
        self.record_failure_at(peer, error, Instant::now())
    }

    pub(crate) fn record_failure_at(
        &mut self,
        peer: PeerId,
        error: &str,
        now: Instant,
    ) -> BanDecision {
        let threshold = self.failure_threshold;
        let cooldown = self.ban_cooldown;
        let entry = self.records.entry(peer).or_default();
        entry.failures = entry.failures.saturating_add(1);
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error.to_owned());

        if entry.consecutive_failures >= threshold {
            entry.banned_until = Some(now + cooldown);
            tracing::debug!(
                peer = %peer,
                cooldown_secs = cooldown.as_secs(),
                failures = entry.failures,
                "peer banned after consecutive failures"
            );
            BanDecision::Banned
        } else {
            BanDecision::Tolerated
        }
    }

    /// Records a response that did not match the request shape. A lying peer
    /// counts like a failed one, with the mismatch tallied separately.
    pub fn record_mismatch(&mut self, peer: PeerId, error: &str) -> BanDecision {
        let entry = self.records.entry(peer).or_default();
        entry.mismatches = entry.mismatches.saturating_add(1);
        self.record_failure(peer, error)
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.is_banned_at(peer, Instant::now())
    }

    pub(crate) fn is_banned_at(&self, peer: &PeerId, now: Instant) -> bool {
        self.records
            .get(peer)
            .map(|entry| entry.is_banned_at(now))
            .unwrap_or(false)
    }

    pub fn banned_count(&self) -> usize {
        let now = Instant::now();
        self.records
            .values()
            .filter(|entry| entry.is_banned_at(now))
            .count()
    }

    pub fn snapshot(&self) -> Vec<PeerReputationDump> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.records.len());
        for (peer, entry) in &self.records {
            let ban_remaining = entry.banned_until.and_then(|until| {
                if now < until {
                    Some(until - now)
                } else {
                    None
                }
            });
            out.push(PeerReputationDump {
                peer: *peer,
                is_banned: entry.is_banned_at(now),
                ban_remaining,
                consecutive_failures: entry.consecutive_failures,
                successes: entry.successes,
                failures: entry.failures,
                mismatches: entry.mismatches,
                last_error: entry.last_error.clone(),
            });
        }
        out.sort_by(|a, b| b.failures.cmp(&a.failures));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PeerReputationTracker {
        PeerReputationTracker::new(2, Duration::from_secs(60))
    }

    #[test]
    fn ban_triggers_after_threshold() {
        let mut tracker = tracker();
        let peer = PeerId::random();

        assert_eq!(tracker.record_failure(peer, "timeout"), BanDecision::Tolerated);
        assert!(!tracker.is_banned(&peer));

        assert_eq!(tracker.record_failure(peer, "timeout"), BanDecision::Banned);
        assert!(tracker.is_banned(&peer));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut tracker = tracker();
        let peer = PeerId::random();

        tracker.record_failure(peer, "disconnect");
        tracker.record_success(peer);
        assert_eq!(tracker.record_failure(peer, "disconnect"), BanDecision::Tolerated);
    }

    #[test]
    fn ban_expires_after_cooldown() {
        let mut tracker = PeerReputationTracker::new(1, Duration::from_secs(30));
        let peer = PeerId::random();
        let start = Instant::now();

        tracker.record_failure_at(peer, "timeout", start);
        assert!(tracker.is_banned_at(&peer, start));
        assert!(tracker.is_banned_at(&peer, start + Duration::from_secs(29)));
        assert!(!tracker.is_banned_at(&peer, start + Duration::from_secs(30)));
    }

    #[test]
    fn mismatch_counts_toward_ban() {
        let mut tracker = tracker();
        let peer = PeerId::random();

        tracker.record_mismatch(peer, "wrong range");
        assert_eq!(tracker.record_mismatch(peer, "wrong range"), BanDecision::Banned);

        let dump = tracker.snapshot();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].mismatches, 2);
        assert!(dump[0].is_banned);
    }
}
