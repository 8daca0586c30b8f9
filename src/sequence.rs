//! Sequence watcher: enforces in-order application of `BookDelta`s and
//! classifies gaps into `{log, snapshot, critical}` tiers.
//!
//! A small bounded-counter state machine guarded behind a lock, one per
//! tracked (venue, symbol) pair, turning "sequence gap" into a "recovery
//! tier" decision the same way a circuit breaker turns a streak of bad
//! outcomes into a halt decision.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::model::BookDelta;
use crate::venue::{Symbol, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapAction {
    /// In order, or duplicate/out-of-order (dropped); no event emitted.
    None,
    Log,
    Snapshot,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapEvent {
    pub venue: Venue,
    pub symbol: Symbol,
    pub expected: i64,
    pub received: i64,
    pub gap_size: i64,
    pub action: GapAction,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotReason {
    Gap,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub venue: Venue,
    pub symbol: Symbol,
    pub reason: SnapshotReason,
    pub gap_size: i64,
    pub priority: crate::publish::Priority,
    pub ts: i64,
}

/// Outcome of feeding one delta through the watcher: the classification,
/// whether the delta should still be applied downstream (every tier except
/// none-from-duplicate applies it), and any side-effect events to publish.
pub struct WatchOutcome {
    pub action: GapAction,
    pub apply: bool,
    pub gap_event: Option<GapEvent>,
    pub snapshot_request: Option<SnapshotRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceTracker {
    expected_next: i64,
    last_seen: i64,
    last_update_ts: i64,
    initialized: bool,
    pub update_count: u64,
    pub gap_count: u64,
    pub duplicate_count: u64,
    pub largest_gap: i64,
}

/// Outcome of classifying a single observed sequence number against a
/// tracker's expectation.
struct Observation {
    action: GapAction,
    /// Gap size for *this* delta (0 for in-order, >0 for a gap). Meaningless
    /// when `action == None` and the delta was a duplicate/out-of-order drop.
    gap: i64,
    is_duplicate: bool,
    expected_before: i64,
}

impl SequenceTracker {
    fn observe(
        &mut self,
        received_seq: i64,
        now_ms: i64,
        gap_log_max: i64,
        gap_snapshot_max: i64,
    ) -> Observation {
        self.last_update_ts = now_ms;

        if !self.initialized {
            self.initialized = true;
            self.expected_next = received_seq + 1;
            self.last_seen = received_seq;
            self.update_count += 1;
            return Observation {
                action: GapAction::None,
                gap: 0,
                is_duplicate: false,
                expected_before: received_seq,
            };
        }

        let expected_before = self.expected_next;
        let gap = received_seq - expected_before;
        self.update_count += 1;

        if gap < 0 {
            self.duplicate_count += 1;
            return Observation {
                action: GapAction::None,
                gap,
                is_duplicate: true,
                expected_before,
            };
        }

        self.last_seen = received_seq;
        self.expected_next = received_seq + 1;

        if gap == 0 {
            return Observation {
                action: GapAction::None,
                gap,
                is_duplicate: false,
                expected_before,
            };
        }

        self.gap_count += 1;
        self.largest_gap = self.largest_gap.max(gap);

        let action = if gap < gap_log_max {
            GapAction::Log
        } else if gap < gap_snapshot_max {
            GapAction::Snapshot
        } else {
            GapAction::Critical
        };

        Observation {
            action,
            gap,
            is_duplicate: false,
            expected_before,
        }
    }
}

/// Registry of one tracker per (venue, symbol), each owned by exactly one
/// writer (the ingest task that applies deltas for that pair) — the
/// `DashMap` only shards lock contention across *different* symbols.
pub struct SequenceWatcher {
    trackers: DashMap<(Venue, Symbol), Mutex<SequenceTracker>>,
    gap_log_max: i64,
    gap_snapshot_max: i64,
    gap_timeout: Duration,
}

impl SequenceWatcher {
    pub fn new(gap_log_max: i64, gap_snapshot_max: i64, gap_timeout: Duration) -> Self {
        Self {
            trackers: DashMap::new(),
            gap_log_max,
            gap_snapshot_max,
            gap_timeout,
        }
    }

    pub fn watch(&self, delta: &BookDelta, now_ms: i64) -> WatchOutcome {
        let key = (delta.venue, delta.symbol.clone());
        let entry = self.trackers.entry(key).or_default();
        let mut tracker = entry.lock().unwrap();
        let obs = tracker.observe(delta.final_seq, now_ms, self.gap_log_max, self.gap_snapshot_max);

        let gap_event = if matches!(obs.action, GapAction::Log | GapAction::Snapshot | GapAction::Critical) {
            Some(GapEvent {
                venue: delta.venue,
                symbol: delta.symbol.clone(),
                expected: obs.expected_before,
                received: delta.final_seq,
                gap_size: obs.gap,
                action: obs.action,
                ts: now_ms,
            })
        } else {
            None
        };

        let snapshot_request = match obs.action {
            GapAction::Snapshot | GapAction::Critical => Some(SnapshotRequest {
                venue: delta.venue,
                symbol: delta.symbol.clone(),
                reason: SnapshotReason::Gap,
                gap_size: obs.gap,
                priority: if obs.action == GapAction::Critical {
                    crate::publish::Priority::High
                } else {
                    crate::publish::Priority::Medium
                },
                ts: now_ms,
            }),
            _ => None,
        };

        if obs.action == GapAction::Critical {
            error!(
                "[{}:{}] CRITICAL sequence gap of {}",
                delta.venue, delta.symbol, obs.gap
            );
        } else if obs.action == GapAction::Snapshot {
            warn!(
                "[{}:{}] sequence gap of {} -> snapshot requested",
                delta.venue, delta.symbol, obs.gap
            );
        }

        WatchOutcome {
            action: obs.action,
            apply: !obs.is_duplicate,
            gap_event,
            snapshot_request,
        }
    }

    /// Checks every tracked (venue, symbol) for staleness; intended to be
    /// driven by a 1s ticker task.
    pub fn check_stale(&self, now_ms: i64) -> Vec<SnapshotRequest> {
        let mut requests = Vec::new();
        for entry in self.trackers.iter() {
            let (venue, symbol) = entry.key().clone();
            let tracker = entry.value().lock().unwrap();
            if tracker.initialized
                && now_ms.saturating_sub(tracker.last_update_ts) > self.gap_timeout.as_millis() as i64
            {
                requests.push(SnapshotRequest {
                    venue,
                    symbol,
                    reason: SnapshotReason::Stale,
                    gap_size: 0,
                    priority: crate::publish::Priority::Medium,
                    ts: now_ms,
                });
            }
        }
        requests
    }

    pub fn stats_for(&self, venue: Venue, symbol: &Symbol) -> Option<SequenceTracker> {
        self.trackers
            .get(&(venue, symbol.clone()))
            .map(|t| t.lock().unwrap().clone())
    }

    /// Global aggregate across all tracked pairs, for the 60s stats report.
    pub fn global_stats(&self) -> (u64, u64, i64) {
        let mut updates = 0u64;
        let mut gaps = 0u64;
        let mut largest = 0i64;
        for entry in self.trackers.iter() {
            let t = entry.value().lock().unwrap();
            updates += t.update_count;
            gaps += t.gap_count;
            largest = largest.max(t.largest_gap);
        }
        (updates, gaps, largest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(seq: i64) -> BookDelta {
        BookDelta {
            venue: Venue::Binance,
            symbol: Symbol::new("btcusdt"),
            bids: vec![],
            asks: vec![],
            first_seq: seq,
            final_seq: seq,
            event_ts: 0,
        }
    }

    #[test]
    fn clean_sequence_has_zero_gap_events() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        for seq in [101, 102, 103] {
            let outcome = watcher.watch(&delta(seq), 0);
            assert!(outcome.gap_event.is_none());
            assert!(outcome.apply);
        }
        let stats = watcher
            .stats_for(Venue::Binance, &Symbol::new("btcusdt"))
            .unwrap();
        assert_eq!(stats.gap_count, 0);
    }

    #[test]
    fn small_gap_of_two_logs_and_applies() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        let outcome = watcher.watch(&delta(104), 0);
        assert_eq!(outcome.action, GapAction::Log);
        assert!(outcome.apply);
        assert!(outcome.snapshot_request.is_none());
        let gap_event = outcome.gap_event.unwrap();
        assert_eq!(gap_event.gap_size, 2);
    }

    #[test]
    fn gap_of_exactly_ten_triggers_snapshot_not_log() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        // expected_next becomes 102; receiving 112 -> gap = 10
        let outcome = watcher.watch(&delta(112), 0);
        assert_eq!(outcome.action, GapAction::Snapshot);
        assert!(outcome.snapshot_request.is_some());
    }

    #[test]
    fn gap_of_exactly_hundred_triggers_critical() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        // expected_next = 102; receiving 202 -> gap = 100
        let outcome = watcher.watch(&delta(202), 0);
        assert_eq!(outcome.action, GapAction::Critical);
    }

    #[test]
    fn medium_gap_escalates_to_snapshot() {
        // deltas {101, 115}: gap = 115 - 102 = 13 -> snapshot, priority medium
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        let outcome = watcher.watch(&delta(115), 0);
        assert_eq!(outcome.action, GapAction::Snapshot);
        assert_eq!(outcome.gap_event.unwrap().gap_size, 13);
        assert_eq!(
            outcome.snapshot_request.unwrap().priority,
            crate::publish::Priority::Medium
        );
    }

    #[test]
    fn duplicate_or_out_of_order_is_dropped() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        watcher.watch(&delta(102), 0);
        let outcome = watcher.watch(&delta(101), 0); // duplicate
        assert_eq!(outcome.action, GapAction::None);
        assert!(!outcome.apply);
    }

    #[test]
    fn stale_tracker_emits_snapshot_request_after_timeout() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        let requests = watcher.check_stale(31_000);
        assert_eq!(requests.len(), 1);
        assert!(matches!(requests[0].reason, SnapshotReason::Stale));
    }

    #[test]
    fn fresh_tracker_does_not_emit_stale_request() {
        let watcher = SequenceWatcher::new(10, 100, Duration::from_secs(30));
        watcher.watch(&delta(101), 0);
        let requests = watcher.check_stale(5_000);
        assert!(requests.is_empty());
    }
}
