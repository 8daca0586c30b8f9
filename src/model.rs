//! Shared data model: the unified schema every venue codec normalizes
//! into, and the records that flow between components.

use serde::{Deserialize, Serialize};

use crate::venue::{Symbol, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// `sign(side)` used by CVD: +1 for buy, -1 for sell.
    pub fn sign(self) -> i8 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

/// A single normalized trade. Produced by the wire codec, consumed by the
/// candle aggregator and flow analytics. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub venue: Venue,
    pub symbol: Symbol,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub event_ts: i64,
    pub trade_id: String,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// A single `(price, qty)` level update. `qty == 0` means "remove this level".
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub qty: f64,
}

/// An incremental order-book update. Applied in arrival order within a
/// (venue, symbol) stream — never reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDelta {
    pub venue: Venue,
    pub symbol: Symbol,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub first_seq: i64,
    pub final_seq: i64,
    pub event_ts: i64,
}

/// A full book image at a specific sequence number, used to recover from
/// gaps and retained by the snapshot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub venue: Venue,
    pub symbol: Symbol,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub snapshot_ts: i64,
    pub seq: i64,
}

/// A venue control frame consumed internally by the Session Supervisor
/// (ping, pong, subscribe ack) rather than passed downstream.
#[derive(Debug, Clone)]
pub enum ControlMsg {
    Ping,
    Pong,
    SubscribeAck { symbol: Symbol },
    SubscribeReject { symbol: Symbol, reason: String },
}

/// What a venue codec produces from one decoded frame.
#[derive(Debug, Clone)]
pub enum Event {
    Trade(Trade),
    BookDelta(BookDelta),
    Control(ControlMsg),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_sign_matches_cvd_convention() {
        assert_eq!(Side::Buy.sign(), 1);
        assert_eq!(Side::Sell.sign(), -1);
    }

    #[test]
    fn trade_notional_is_price_times_quantity() {
        let t = Trade {
            venue: Venue::Binance,
            symbol: Symbol::new("btcusdt"),
            price: 50_000.0,
            quantity: 2.5,
            side: Side::Buy,
            event_ts: 0,
            trade_id: "1".into(),
        };
        assert_eq!(t.notional(), 125_000.0);
    }
}
