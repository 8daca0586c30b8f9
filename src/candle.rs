//! Candle aggregator: buckets trades into OHLCV candles across ~15
//! simultaneous timeframes per (venue, symbol), lock-free per bucket.
//!
//! Follows the same `DashMap` + `ArcSwap` shape as the order-book registry
//! (`orderbook.rs`): each `(venue,
//! symbol, timeframe)` triple is its own entry, so different symbols or
//! timeframes never contend, and a read (e.g. the publish fabric pulling the
//! latest closed candle) never blocks a concurrent trade-driven update.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{Side, Trade};
use crate::venue::{Symbol, Venue};

/// One of the ~15 default timeframes, expressed in seconds so new
/// granularities can be added purely through configuration.
pub type TimeframeSecs = u32;

pub const DEFAULT_TIMEFRAMES_SECS: &[TimeframeSecs] = &[
    1, 5, 15, 30, 60, 180, 300, 900, 1800, 3600, 7200, 14400, 21600, 43200, 86400,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub venue: Venue,
    pub symbol: Symbol,
    pub timeframe_secs: TimeframeSecs,
    pub bucket_start_ms: i64,
    pub open_ts: i64,
    pub close_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub vwap: f64,
    pub trade_count: u64,
    pub closed: bool,
}

impl Candle {
    fn open_with(trade: &Trade, bucket_start_ms: i64, timeframe_secs: TimeframeSecs) -> Self {
        let taker_buy = trade.side == Side::Buy;
        Candle {
            venue: trade.venue,
            symbol: trade.symbol.clone(),
            timeframe_secs,
            bucket_start_ms,
            open_ts: bucket_start_ms,
            close_ts: bucket_start_ms + timeframe_secs as i64 * 1000,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.quantity,
            quote_volume: trade.notional(),
            taker_buy_volume: if taker_buy { trade.quantity } else { 0.0 },
            taker_buy_quote_volume: if taker_buy { trade.notional() } else { 0.0 },
            vwap: trade.price,
            trade_count: 1,
            closed: false,
        }
    }

    fn absorb(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.quantity;
        self.quote_volume += trade.notional();
        if trade.side == Side::Buy {
            self.taker_buy_volume += trade.quantity;
            self.taker_buy_quote_volume += trade.notional();
        }
        self.trade_count += 1;
        self.vwap = if self.volume == 0.0 {
            self.close
        } else {
            self.quote_volume / self.volume
        };
    }
}

fn bucket_start(event_ts_ms: i64, timeframe_secs: TimeframeSecs) -> i64 {
    let width_ms = timeframe_secs as i64 * 1000;
    (event_ts_ms / width_ms) * width_ms
}

/// Outcome of feeding one trade into a bucket: the (possibly just-opened)
/// live candle, and the previous bucket if this trade rolled it over and
/// closed it.
pub struct AbsorbOutcome {
    pub live: Candle,
    pub closed: Option<Candle>,
}

type BucketKey = (Venue, Symbol, TimeframeSecs);

pub struct CandleAggregator {
    buckets: DashMap<BucketKey, Arc<ArcSwap<Candle>>>,
    timeframes: Vec<TimeframeSecs>,
    emit_empty_candles: bool,
}

impl CandleAggregator {
    pub fn new(timeframes: Vec<TimeframeSecs>, emit_empty_candles: bool) -> Self {
        Self {
            buckets: DashMap::new(),
            timeframes,
            emit_empty_candles,
        }
    }

    pub fn timeframes(&self) -> &[TimeframeSecs] {
        &self.timeframes
    }

    pub fn emits_empty_candles(&self) -> bool {
        self.emit_empty_candles
    }

    /// Feeds a trade into every configured timeframe bucket for its (venue,
    /// symbol), returning one outcome per timeframe touched.
    pub fn absorb(&self, trade: &Trade) -> Vec<(TimeframeSecs, AbsorbOutcome)> {
        self.timeframes
            .iter()
            .map(|&tf| (tf, self.absorb_one(trade, tf)))
            .collect()
    }

    fn absorb_one(&self, trade: &Trade, timeframe_secs: TimeframeSecs) -> AbsorbOutcome {
        let key = (trade.venue, trade.symbol.clone(), timeframe_secs);
        let start = bucket_start(trade.event_ts, timeframe_secs);

        let swap = self
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(ArcSwap::from_pointee(Candle::open_with(trade, start, timeframe_secs))))
            .clone();

        let current = swap.load();

        // Trade belongs to the live bucket: absorb in place.
        if current.bucket_start_ms == start {
            let mut next = (**current).clone();
            next.absorb(trade);
            swap.store(Arc::new(next.clone()));
            return AbsorbOutcome { live: next, closed: None };
        }

        // A late/out-of-order trade for a bucket strictly older than the
        // live one: we never reopen a bucket that has already rolled over,
        // so it's dropped from the in-memory aggregate (the bucket it
        // belonged to has already been emitted downstream).
        if start < current.bucket_start_ms {
            return AbsorbOutcome {
                live: (**current).clone(),
                closed: None,
            };
        }

        // Trade rolls the bucket over: close the old one, open a new one.
        let mut closed = (**current).clone();
        closed.closed = true;
        let opened = Candle::open_with(trade, start, timeframe_secs);
        swap.store(Arc::new(opened.clone()));

        AbsorbOutcome {
            live: opened,
            closed: Some(closed),
        }
    }

    pub fn current(&self, venue: Venue, symbol: &Symbol, timeframe_secs: TimeframeSecs) -> Option<Candle> {
        self.buckets
            .get(&(venue, symbol.clone(), timeframe_secs))
            .map(|s| s.load().as_ref().clone())
    }
}
