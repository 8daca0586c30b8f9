//! Order-book registry: maintains a consistent top-of-book and depth view
//! per (venue, symbol), fed by the codec's `BookDelta`s and the sequence
//! watcher's gap classification.
//!
//! A `DashMap` shards lock contention across symbols, and each symbol's
//! book is an `ArcSwap<BookState>` so every read (best bid/ask, depth,
//! imbalance) is lock-free copy-on-write. On top of that, a pending-
//! snapshot pause: when the sequence watcher reports a gap serious enough
//! to need a snapshot, the book stops applying deltas and buffers them
//! until the snapshot lands, then discards the buffer and resumes from the
//! snapshot's sequence.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::error;
use ordered_float::OrderedFloat;

use crate::error::IngestError;
use crate::model::{BookDelta, Level, Snapshot};
use crate::venue::{Symbol, Venue};

const MAX_BUFFERED_DELTAS: usize = 256;
pub const DEFAULT_MAX_LEVELS: usize = 1000;

#[derive(Clone, Debug, Default)]
struct BookState {
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    last_seq: i64,
    initialized: bool,
    /// Set once a gap is too large to recover incrementally; deltas are
    /// buffered (not applied) until a snapshot clears it.
    awaiting_snapshot: bool,
    buffered: Vec<BookDelta>,
}

impl BookState {
    fn apply_levels(&mut self, bids: &[Level], asks: &[Level], max_levels: usize) {
        for lvl in bids {
            if lvl.qty == 0.0 {
                self.bids.remove(&OrderedFloat(lvl.price));
            } else {
                self.bids.insert(OrderedFloat(lvl.price), lvl.qty);
            }
        }
        for lvl in asks {
            if lvl.qty == 0.0 {
                self.asks.remove(&OrderedFloat(lvl.price));
            } else {
                self.asks.insert(OrderedFloat(lvl.price), lvl.qty);
            }
        }
        self.trim(max_levels);
    }

    /// Drops the deepest entries past `max_levels` per side: lowest-priced
    /// bids, highest-priced asks.
    fn trim(&mut self, max_levels: usize) {
        while self.bids.len() > max_levels {
            if let Some((&price, _)) = self.bids.iter().next() {
                self.bids.remove(&price);
            }
        }
        while self.asks.len() > max_levels {
            if let Some((&price, _)) = self.asks.iter().next_back() {
                self.asks.remove(&price);
            }
        }
    }

    /// A crossed book (best bid >= best ask) or any negative quantity means
    /// the accumulated state can no longer be trusted.
    fn is_corrupted(&self) -> bool {
        if let (Some((&bid, _)), Some((&ask, _))) = (self.bids.iter().next_back(), self.asks.iter().next()) {
            if bid >= ask {
                return true;
            }
        }
        self.bids.values().any(|&q| q < 0.0) || self.asks.values().any(|&q| q < 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub qty: f64,
}

/// Registry of one book per (venue, symbol); the `DashMap` only shards lock
/// contention across *different* symbols, matching the reference.
pub struct OrderBookRegistry {
    books: DashMap<(Venue, Symbol), Arc<ArcSwap<BookState>>>,
    max_levels: usize,
}

impl OrderBookRegistry {
    pub fn new() -> Self {
        Self::with_max_levels(DEFAULT_MAX_LEVELS)
    }

    pub fn with_max_levels(max_levels: usize) -> Self {
        Self {
            books: DashMap::new(),
            max_levels,
        }
    }

    fn entry(&self, venue: Venue, symbol: &Symbol) -> Arc<ArcSwap<BookState>> {
        self.books
            .entry((venue, symbol.clone()))
            .or_insert_with(|| Arc::new(ArcSwap::from_pointee(BookState::default())))
            .clone()
    }

    pub fn book(&self, venue: Venue, symbol: &Symbol) -> BookHandle {
        BookHandle {
            swap: self.entry(venue, symbol),
            venue,
            symbol: symbol.clone(),
        }
    }

    pub fn apply_snapshot(&self, snapshot: &Snapshot) {
        let swap = self.entry(snapshot.venue, &snapshot.symbol);
        let mut new_state = BookState {
            last_seq: snapshot.seq,
            initialized: true,
            awaiting_snapshot: false,
            buffered: Vec::new(),
            ..Default::default()
        };
        new_state.apply_levels(&snapshot.bids, &snapshot.asks, self.max_levels);

        // Replay any deltas buffered while waiting for this snapshot that
        // are strictly newer than it: everything older than the snapshot is
        // superseded, anything after it is still valid incremental state.
        let stale = swap.load();
        for delta in &stale.buffered {
            if delta.final_seq > new_state.last_seq {
                new_state.apply_levels(&delta.bids, &delta.asks, self.max_levels);
                new_state.last_seq = delta.final_seq;
            }
        }

        swap.store(Arc::new(new_state));
    }

    /// Marks a book as needing a fresh snapshot before further deltas can be
    /// trusted (invoked by the Sequence Watcher on a snapshot-tier or
    /// critical-tier gap). Deltas observed after this call are buffered
    /// rather than applied.
    pub fn request_snapshot(&self, venue: Venue, symbol: &Symbol) {
        let swap = self.entry(venue, symbol);
        let mut next = (**swap.load()).clone();
        next.awaiting_snapshot = true;
        swap.store(Arc::new(next));
    }

    /// Applies an in-order delta. Returns `false` (no-op) if the book is
    /// paused awaiting a snapshot, in which case the delta is buffered
    /// instead so it can be replayed once the snapshot arrives.
    pub fn apply_delta(&self, delta: &BookDelta) -> bool {
        let swap = self.entry(delta.venue, &delta.symbol);
        let current = swap.load();

        if !current.initialized || current.awaiting_snapshot {
            let mut next = (**current).clone();
            if next.buffered.len() >= MAX_BUFFERED_DELTAS {
                next.buffered.remove(0);
            }
            next.buffered.push(delta.clone());
            swap.store(Arc::new(next));
            return false;
        }

        let mut next = (**current).clone();
        next.apply_levels(&delta.bids, &delta.asks, self.max_levels);
        next.last_seq = delta.final_seq;

        if next.is_corrupted() {
            let err = IngestError::BookCorruption {
                venue: delta.venue,
                symbol: delta.symbol.clone(),
                message: "crossed book or negative quantity after apply".into(),
            };
            error!("{err}; pausing {}:{} pending snapshot", delta.venue, delta.symbol);
            next.awaiting_snapshot = true;
        }

        swap.store(Arc::new(next));
        true
    }

    pub fn symbols(&self) -> Vec<(Venue, Symbol)> {
        self.books
            .iter()
            .filter(|e| e.value().load().initialized)
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Default for OrderBookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free read handle into a single book.
#[derive(Clone)]
pub struct BookHandle {
    swap: Arc<ArcSwap<BookState>>,
    pub venue: Venue,
    pub symbol: Symbol,
}

impl BookHandle {
    pub fn is_initialized(&self) -> bool {
        self.swap.load().initialized
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.swap.load().awaiting_snapshot
    }

    pub fn last_seq(&self) -> i64 {
        self.swap.load().last_seq
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        let s = self.swap.load();
        s.bids
            .iter()
            .next_back()
            .map(|(p, q)| PriceLevel { price: p.0, qty: *q })
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        let s = self.swap.load();
        s.asks
            .iter()
            .next()
            .map(|(p, q)| PriceLevel { price: p.0, qty: *q })
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Spread in basis points of the mid price.
    pub fn spread_bps(&self) -> Option<f64> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        let mid = (bid + ask) / 2.0;
        if mid == 0.0 {
            return None;
        }
        Some((ask - bid) / mid * 10_000.0)
    }

    pub fn depth_bids(&self, n: usize) -> Vec<PriceLevel> {
        let s = self.swap.load();
        s.bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, q)| PriceLevel { price: p.0, qty: *q })
            .collect()
    }

    pub fn depth_asks(&self, n: usize) -> Vec<PriceLevel> {
        let s = self.swap.load();
        s.asks
            .iter()
            .take(n)
            .map(|(p, q)| PriceLevel { price: p.0, qty: *q })
            .collect()
    }

    /// (bid_volume - ask_volume) / (bid_volume + ask_volume) over the top N
    /// levels each side, in [-1, 1]. Positive means bid-heavy.
    pub fn imbalance(&self, depth: usize) -> Option<f64> {
        let bids: f64 = self.depth_bids(depth).iter().map(|l| l.qty).sum();
        let asks: f64 = self.depth_asks(depth).iter().map(|l| l.qty).sum();
        let total = bids + asks;
        if total == 0.0 {
            return None;
        }
        Some((bids - asks) / total)
    }

    /// Levels within `depth` whose size is >= `wall_size`.
    pub fn walls(&self, depth: usize, wall_size: f64) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let bids = self
            .depth_bids(depth)
            .into_iter()
            .filter(|l| l.qty >= wall_size)
            .collect();
        let asks = self
            .depth_asks(depth)
            .into_iter()
            .filter(|l| l.qty >= wall_size)
            .collect();
        (bids, asks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, qty: f64) -> Level {
        Level { price, qty }
    }

    fn snapshot(seq: i64, bids: Vec<Level>, asks: Vec<Level>) -> Snapshot {
        Snapshot {
            venue: Venue::Binance,
            symbol: Symbol::new("btcusdt"),
            bids,
            asks,
            snapshot_ts: 0,
            seq,
        }
    }

    fn delta(first_seq: i64, final_seq: i64, bids: Vec<Level>, asks: Vec<Level>) -> BookDelta {
        BookDelta {
            venue: Venue::Binance,
            symbol: Symbol::new("btcusdt"),
            bids,
            asks,
            first_seq,
            final_seq,
            event_ts: 0,
        }
    }

    #[test]
    fn snapshot_then_delta_updates_best_levels() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(&snapshot(
            100,
            vec![level(49900.0, 1.0)],
            vec![level(50100.0, 2.0)],
        ));
        let applied = reg.apply_delta(&delta(
            101,
            101,
            vec![level(49950.0, 3.0)],
            vec![],
        ));
        assert!(applied);

        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert_eq!(book.best_bid().unwrap().price, 49950.0);
        assert_eq!(book.best_ask().unwrap().price, 50100.0);
    }

    #[test]
    fn zero_quantity_level_removes_it() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(&snapshot(
            100,
            vec![level(49900.0, 1.0), level(49800.0, 2.0)],
            vec![],
        ));
        reg.apply_delta(&delta(101, 101, vec![level(49900.0, 0.0)], vec![]));

        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert_eq!(book.best_bid().unwrap().price, 49800.0);
    }

    #[test]
    fn deltas_before_first_snapshot_are_not_applied() {
        let reg = OrderBookRegistry::new();
        let applied = reg.apply_delta(&delta(1, 1, vec![level(100.0, 1.0)], vec![]));
        assert!(!applied);
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert!(!book.is_initialized());
    }

    #[test]
    fn pending_snapshot_pause_buffers_and_then_replays() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(&snapshot(100, vec![level(100.0, 1.0)], vec![]));
        reg.request_snapshot(Venue::Binance, &Symbol::new("btcusdt"));

        // While paused, deltas are buffered, not applied.
        let applied = reg.apply_delta(&delta(101, 105, vec![level(101.0, 5.0)], vec![]));
        assert!(!applied);
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert!(book.is_awaiting_snapshot());
        assert!(book.best_bid().unwrap().price != 101.0);

        // New snapshot clears the pause and replays the buffered delta.
        reg.apply_snapshot(&snapshot(103, vec![level(100.0, 1.0)], vec![]));
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert!(!book.is_awaiting_snapshot());
        assert_eq!(book.best_bid().unwrap().price, 101.0);
    }

    #[test]
    fn imbalance_is_bid_heavy_positive() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(&snapshot(
            100,
            vec![level(100.0, 10.0)],
            vec![level(101.0, 2.0)],
        ));
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        let imb = book.imbalance(10).unwrap();
        assert!(imb > 0.0);
    }

    #[test]
    fn spread_bps_matches_basis_point_definition() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(&snapshot(
            100,
            vec![level(100.0, 1.0)],
            vec![level(101.0, 1.0)],
        ));
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        // spread=1, mid=100.5 -> 1/100.5 * 10000 ~= 99.5
        assert!((book.spread_bps().unwrap() - 99.5).abs() < 0.1);
    }

    #[test]
    fn trim_drops_deepest_levels_past_max_levels() {
        let reg = OrderBookRegistry::with_max_levels(2);
        reg.apply_snapshot(&snapshot(
            100,
            vec![level(100.0, 1.0), level(99.0, 1.0), level(98.0, 1.0)],
            vec![level(101.0, 1.0), level(102.0, 1.0), level(103.0, 1.0)],
        ));
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert_eq!(book.depth_bids(10).len(), 2);
        assert_eq!(book.depth_asks(10).len(), 2);
        assert_eq!(book.best_bid().unwrap().price, 100.0);
        assert_eq!(book.best_ask().unwrap().price, 101.0);
    }

    #[test]
    fn crossed_book_pauses_for_snapshot() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(&snapshot(100, vec![level(100.0, 1.0)], vec![level(101.0, 1.0)]));
        // A delta that crosses the book: bid at 102 now above the 101 ask.
        reg.apply_delta(&delta(101, 101, vec![level(102.0, 1.0)], vec![]));
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        assert!(book.is_awaiting_snapshot());
    }

    #[test]
    fn walls_filters_by_minimum_size() {
        let reg = OrderBookRegistry::new();
        reg.apply_snapshot(
            &snapshot(
                100,
                vec![level(100.0, 1.0), level(99.0, 60.0)],
                vec![level(101.0, 70.0)],
            ),
        );
        let book = reg.book(Venue::Binance, &Symbol::new("btcusdt"));
        let (bid_walls, ask_walls) = book.walls(10, 50.0);
        assert_eq!(bid_walls.len(), 1);
        assert_eq!(bid_walls[0].price, 99.0);
        assert_eq!(ask_walls.len(), 1);
    }
}
