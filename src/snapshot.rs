//! Snapshot store: a windowed, in-memory history of book snapshots per
//! (venue, symbol), used both to answer gap-recovery requests from the
//! sequence watcher and to let new subscribers bootstrap.
//!
//! Same `DashMap`-sharded-by-symbol shape as `orderbook.rs`, but each entry
//! is a `BTreeMap<i64, Snapshot>` keyed by capture timestamp rather than a
//! single `ArcSwap` cell, since this component explicitly keeps a window of
//! history instead of only the latest value.

use std::collections::BTreeMap;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::model::Snapshot;
use crate::venue::{Symbol, Venue};

pub struct SnapshotStore {
    windows: DashMap<(Venue, Symbol), Mutex<BTreeMap<i64, Snapshot>>>,
    retention_ms: i64,
}

impl SnapshotStore {
    pub fn new(retention_secs: i64) -> Self {
        Self {
            windows: DashMap::new(),
            retention_ms: retention_secs * 1000,
        }
    }

    pub fn store(&self, snapshot: Snapshot) {
        let key = (snapshot.venue, snapshot.symbol.clone());
        let entry = self.windows.entry(key).or_default();
        let mut window = entry.lock().unwrap();
        window.insert(snapshot.snapshot_ts, snapshot);
    }

    /// Drops entries older than the retention window, relative to `now_ms`.
    /// Intended to be driven by a periodic ticker (default 1s).
    pub fn evict_expired(&self, now_ms: i64) {
        for entry in self.windows.iter() {
            let mut window = entry.value().lock().unwrap();
            let cutoff = now_ms - self.retention_ms;
            let expired: Vec<i64> = window.range(..cutoff).map(|(ts, _)| *ts).collect();
            for ts in expired {
                window.remove(&ts);
            }
        }
    }

    pub fn latest(&self, venue: Venue, symbol: &Symbol) -> Option<Snapshot> {
        let entry = self.windows.get(&(venue, symbol.clone()))?;
        let window = entry.lock().unwrap();
        window.values().next_back().cloned()
    }

    /// The most recent snapshot whose capture time is at or before `ts_ms`,
    /// for point-in-time gap recovery.
    pub fn at_or_before(&self, venue: Venue, symbol: &Symbol, ts_ms: i64) -> Option<Snapshot> {
        let entry = self.windows.get(&(venue, symbol.clone()))?;
        let window = entry.lock().unwrap();
        window.range(..=ts_ms).next_back().map(|(_, s)| s.clone())
    }

    pub fn window_len(&self, venue: Venue, symbol: &Symbol) -> usize {
        self.windows
            .get(&(venue, symbol.clone()))
            .map(|e| e.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Level;

    fn snapshot(ts: i64, seq: i64) -> Snapshot {
        Snapshot {
            venue: Venue::Binance,
            symbol: Symbol::new("btcusdt"),
            bids: vec![Level { price: 100.0, qty: 1.0 }],
            asks: vec![],
            snapshot_ts: ts,
            seq,
        }
    }

    #[test]
    fn latest_returns_most_recent_by_timestamp() {
        let store = SnapshotStore::new(3600);
        store.store(snapshot(1_000, 1));
        store.store(snapshot(2_000, 2));
        let latest = store.latest(Venue::Binance, &Symbol::new("btcusdt")).unwrap();
        assert_eq!(latest.seq, 2);
    }

    #[test]
    fn at_or_before_finds_nearest_earlier_snapshot() {
        let store = SnapshotStore::new(3600);
        store.store(snapshot(1_000, 1));
        store.store(snapshot(3_000, 3));
        let found = store
            .at_or_before(Venue::Binance, &Symbol::new("btcusdt"), 2_500)
            .unwrap();
        assert_eq!(found.seq, 1);
    }

    #[test]
    fn eviction_drops_entries_past_retention_window() {
        let store = SnapshotStore::new(10); // 10s retention
        store.store(snapshot(0, 1));
        store.store(snapshot(20_000, 2));
        store.evict_expired(20_000);
        assert_eq!(store.window_len(Venue::Binance, &Symbol::new("btcusdt")), 1);
        let latest = store.latest(Venue::Binance, &Symbol::new("btcusdt")).unwrap();
        assert_eq!(latest.seq, 2);
    }
}
