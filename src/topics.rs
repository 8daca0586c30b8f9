//! Centralized publish-topic builders. Every producer goes through these
//! functions rather than formatting topic strings inline, so the
//! wire-level naming convention lives in exactly one place.

use crate::candle::TimeframeSecs;
use crate::venue::{Symbol, Venue};

pub fn trade(venue: Venue, symbol: &Symbol) -> String {
    format!("trade:{venue}:{symbol}")
}

pub fn depth(venue: Venue, symbol: &Symbol) -> String {
    format!("depth:{venue}:{symbol}")
}

pub fn candle(timeframe_secs: TimeframeSecs, symbol: &Symbol) -> String {
    format!("candle:{timeframe_secs}:{symbol}")
}

pub fn orderflow(symbol: &Symbol) -> String {
    format!("orderflow:{symbol}")
}

pub fn orderbook(symbol: &Symbol) -> String {
    format!("orderbook:{symbol}")
}

pub fn cvd(symbol: &Symbol) -> String {
    format!("cvd:{symbol}")
}

pub fn whale(symbol: &Symbol) -> String {
    format!("whale:{symbol}")
}

pub fn liquidation(venue: Venue, symbol: &Symbol) -> String {
    format!("liquidation:{venue}:{symbol}")
}

pub fn snapshots(venue: Venue, symbol: &Symbol) -> String {
    format!("snapshots:{venue}:{symbol}")
}

pub fn snapshot_requests() -> &'static str {
    "snapshot_requests"
}

pub fn gap_detection() -> &'static str {
    "gap_detection"
}

pub fn health() -> &'static str {
    "health"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_builders_match_colon_delimited_convention() {
        let sym = Symbol::new("btcusdt");
        assert_eq!(trade(Venue::Binance, &sym), "trade:binance:btcusdt");
        assert_eq!(depth(Venue::Bybit, &sym), "depth:bybit:btcusdt");
        assert_eq!(candle(60, &sym), "candle:60:btcusdt");
        assert_eq!(orderflow(&sym), "orderflow:btcusdt");
        assert_eq!(orderbook(&sym), "orderbook:btcusdt");
        assert_eq!(cvd(&sym), "cvd:btcusdt");
        assert_eq!(whale(&sym), "whale:btcusdt");
        assert_eq!(liquidation(Venue::Okx, &sym), "liquidation:okx:btcusdt");
        assert_eq!(snapshots(Venue::Binance, &sym), "snapshots:binance:btcusdt");
        assert_eq!(snapshot_requests(), "snapshot_requests");
        assert_eq!(gap_detection(), "gap_detection");
    }
}
