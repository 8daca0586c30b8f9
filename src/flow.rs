//! Flow analytics: cumulative volume delta, whale detection, and
//! order-flow classification per (venue, symbol).
//!
//! A small per-symbol state struct holds bounded counters/windows behind a
//! lock, with a `config` of per-symbol thresholds and an `observe` method
//! that folds in one new trade plus the prevailing best quote and derives a
//! classification.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::model::{Side, Trade};
use crate::venue::{Symbol, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowClass {
    Aggressive,
    Passive,
    Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleEvent {
    pub venue: Venue,
    pub symbol: Symbol,
    pub side: Side,
    pub notional: f64,
    pub confidence: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CvdWindows {
    pub w1m: f64,
    pub w5m: f64,
    pub w15m: f64,
    pub w1h: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub cvd: CvdWindows,
    pub class: FlowClass,
    pub trade_count: u64,
}

const WINDOW_1M_MS: i64 = 60_000;
const WINDOW_5M_MS: i64 = 300_000;
const WINDOW_15M_MS: i64 = 900_000;
const WINDOW_1H_MS: i64 = 3_600_000;

/// The prevailing best bid/ask at the moment a trade is observed, supplied
/// by the order-book registry. Absent before the book has a first snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BestQuote {
    pub best_bid: f64,
    pub best_ask: f64,
}

/// One signed-volume sample, kept only long enough to roll off the largest
/// window (1h); shorter windows are derived by filtering the same deque.
struct Sample {
    ts: i64,
    signed_volume: f64,
}

#[derive(Default)]
struct SymbolFlow {
    samples: VecDeque<Sample>,
    trade_count: u64,
    prior_best: Option<BestQuote>,
}

impl SymbolFlow {
    fn push(&mut self, trade: &Trade, now_ms: i64) {
        self.samples.push_back(Sample {
            ts: trade.event_ts,
            signed_volume: trade.quantity * trade.side.sign() as f64,
        });
        while let Some(front) = self.samples.front() {
            if now_ms - front.ts > WINDOW_1H_MS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.trade_count += 1;
    }

    fn cvd(&self, now_ms: i64) -> CvdWindows {
        let mut w1m = 0.0;
        let mut w5m = 0.0;
        let mut w15m = 0.0;
        let mut w1h = 0.0;
        for s in &self.samples {
            let age = now_ms - s.ts;
            if age <= WINDOW_1H_MS {
                w1h += s.signed_volume;
            }
            if age <= WINDOW_15M_MS {
                w15m += s.signed_volume;
            }
            if age <= WINDOW_5M_MS {
                w5m += s.signed_volume;
            }
            if age <= WINDOW_1M_MS {
                w1m += s.signed_volume;
            }
        }
        CvdWindows { w1m, w5m, w15m, w1h }
    }

    /// `aggressive` if the trade's price impact against the prior best
    /// quote clears `impact_threshold_pct`; `passive` if it landed within
    /// one tick of the prior best (absorbed without moving the quote);
    /// `market` otherwise (no prior best to compare against, or an impact
    /// between the two).
    fn classify(&self, trade: &Trade, best: Option<BestQuote>, impact_threshold_pct: f64) -> FlowClass {
        let prior = match self.prior_best {
            Some(p) => p,
            None => return FlowClass::Market,
        };

        let reference = match trade.side {
            Side::Buy => prior.best_ask,
            Side::Sell => prior.best_bid,
        };
        if reference == 0.0 {
            return FlowClass::Market;
        }

        let impact_pct = (trade.price - reference).abs() / reference;
        if impact_pct >= impact_threshold_pct {
            return FlowClass::Aggressive;
        }

        let tick = best.map(|_| reference * 0.0001).unwrap_or(0.0);
        if (trade.price - reference).abs() <= tick.max(f64::EPSILON) {
            FlowClass::Passive
        } else {
            FlowClass::Market
        }
    }
}

pub struct FlowAnalytics {
    symbols: DashMap<(Venue, Symbol), Mutex<SymbolFlow>>,
    config: PipelineConfig,
}

impl FlowAnalytics {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            symbols: DashMap::new(),
            config,
        }
    }

    /// Folds in a trade and the prevailing best quote, returning the
    /// refreshed CVD/classification snapshot and a `WhaleEvent` if this
    /// trade's notional clears the symbol's configured whale floor.
    pub fn observe(&self, trade: &Trade, now_ms: i64, best: Option<BestQuote>) -> (FlowSnapshot, Option<WhaleEvent>) {
        let thresholds = self.config.thresholds_for(trade.symbol.as_str());
        let key = (trade.venue, trade.symbol.clone());
        let entry = self.symbols.entry(key).or_default();
        let mut flow = entry.lock().unwrap();

        let class = flow.classify(trade, best, thresholds.impact_threshold_pct);
        flow.push(trade, now_ms);
        flow.prior_best = best;
        let cvd = flow.cvd(now_ms);
        let trade_count = flow.trade_count;

        let threshold = thresholds.whale_notional_usd;
        let k = self.config.analytics.whale_confidence_k.max(f64::EPSILON);
        let whale = if trade.notional() >= threshold {
            Some(WhaleEvent {
                venue: trade.venue,
                symbol: trade.symbol.clone(),
                side: trade.side,
                notional: trade.notional(),
                confidence: (trade.notional() / (k * threshold)).min(1.0),
                ts: now_ms,
            })
        } else {
            None
        };

        (
            FlowSnapshot {
                cvd,
                class,
                trade_count,
            },
            whale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyticsConfig, RuntimeConfig, SymbolThresholds};
    use std::collections::HashMap;

    fn config_with_whale_floor(whale_notional_usd: f64, k: f64) -> PipelineConfig {
        PipelineConfig {
            venues: HashMap::new(),
            symbol_thresholds: HashMap::new(),
            default_thresholds: SymbolThresholds {
                whale_notional_usd,
                ..Default::default()
            },
            analytics: AnalyticsConfig {
                whale_confidence_k: k,
                ..Default::default()
            },
            runtime: RuntimeConfig::default(),
        }
    }

    fn trade(qty: f64, side: Side, ts: i64, price: f64) -> Trade {
        Trade {
            venue: Venue::Binance,
            symbol: Symbol::new("btcusdt"),
            price,
            quantity: qty,
            side,
            event_ts: ts,
            trade_id: "1".into(),
        }
    }

    #[test]
    fn cvd_accumulates_signed_volume() {
        let flow = FlowAnalytics::new(config_with_whale_floor(1_000_000.0, 1.0));
        flow.observe(&trade(1.0, Side::Buy, 0, 100.0), 0, None);
        let (snap, _) = flow.observe(&trade(2.0, Side::Sell, 1_000, 100.0), 1_000, None);
        assert_eq!(snap.cvd.w1m, -1.0);
        assert_eq!(snap.trade_count, 2);
    }

    #[test]
    fn samples_older_than_one_hour_roll_off() {
        let flow = FlowAnalytics::new(config_with_whale_floor(1_000_000.0, 1.0));
        flow.observe(&trade(5.0, Side::Buy, 0, 100.0), 0, None);
        let (snap, _) = flow.observe(&trade(1.0, Side::Buy, 4_000_000, 100.0), 4_000_000, None);
        assert_eq!(snap.cvd.w1h, 1.0);
    }

    #[test]
    fn notional_above_configured_threshold_emits_whale_on_a_fresh_symbol() {
        // Scenario: notional 125,000 >= whale_notional_usd 100,000 with no
        // trade history at all — a statistical floor would never fire here.
        let flow = FlowAnalytics::new(config_with_whale_floor(100_000.0, 1.0));
        let (_, whale) = flow.observe(&trade(1.25, Side::Buy, 0, 100_000.0), 0, None);
        let whale = whale.expect("expected whale event on a fresh symbol");
        assert_eq!(whale.notional, 125_000.0);
    }

    #[test]
    fn confidence_is_clamped_to_one() {
        let flow = FlowAnalytics::new(config_with_whale_floor(100_000.0, 1.0));
        let (_, whale) = flow.observe(&trade(10.0, Side::Buy, 0, 100_000.0), 0, None);
        assert_eq!(whale.unwrap().confidence, 1.0);
    }

    #[test]
    fn notional_below_threshold_never_triggers_whale() {
        let flow = FlowAnalytics::new(config_with_whale_floor(1_000_000.0, 1.0));
        let (_, whale) = flow.observe(&trade(100.0, Side::Buy, 0, 100.0), 0, None);
        assert!(whale.is_none());
    }

    #[test]
    fn price_impact_past_threshold_is_aggressive() {
        let flow = FlowAnalytics::new(config_with_whale_floor(1_000_000.0, 1.0));
        let best = BestQuote { best_bid: 99.9, best_ask: 100.0 };
        flow.observe(&trade(1.0, Side::Buy, 0, 100.0), 0, Some(best));
        // Next buy trade crosses 10% above the prior best ask.
        let (snap, _) = flow.observe(&trade(1.0, Side::Buy, 1_000, 110.0), 1_000, Some(best));
        assert_eq!(snap.class, FlowClass::Aggressive);
    }

    #[test]
    fn trade_at_prior_best_is_passive() {
        let flow = FlowAnalytics::new(config_with_whale_floor(1_000_000.0, 1.0));
        let best = BestQuote { best_bid: 99.9, best_ask: 100.0 };
        flow.observe(&trade(1.0, Side::Buy, 0, 100.0), 0, Some(best));
        let (snap, _) = flow.observe(&trade(1.0, Side::Buy, 1_000, 100.0), 1_000, Some(best));
        assert_eq!(snap.class, FlowClass::Passive);
    }

    #[test]
    fn no_prior_best_classifies_as_market() {
        let flow = FlowAnalytics::new(config_with_whale_floor(1_000_000.0, 1.0));
        let (snap, _) = flow.observe(&trade(1.0, Side::Buy, 0, 100.0), 0, None);
        assert_eq!(snap.class, FlowClass::Market);
    }
}
