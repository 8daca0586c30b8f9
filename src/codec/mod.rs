//! Wire codecs: venue-specific parsers producing the unified `Event` schema
//! from `crate::model`. Mirrors a match-on-channel read-loop shape, but
//! split one module per venue instead of inlined in the read loop, since
//! this core must speak three independent grammars instead of one.

pub mod binance;
pub mod bybit;
pub mod okx;

use crate::model::Event;
use crate::venue::{Symbol, Venue};

/// Capability set every venue codec implements: a tagged variant instead of
/// an inheritance hierarchy. `decode` is the single point of contact with
/// exchange wire semantics — nothing venue-specific leaks past it.
pub trait VenueCodec: Send + Sync {
    fn venue(&self) -> Venue;

    /// Decodes one raw text frame into zero or more normalized events.
    /// Unrecognized topics and malformed JSON produce `Ok(vec![])` plus a
    /// warn-level log at the call site — never an `Err` that would close
    /// the session.
    fn decode(&self, frame: &str) -> Vec<Event>;

    /// Builds the subscription request frame(s) for one symbol.
    fn subscribe_payloads(&self, symbol: &Symbol) -> Vec<String>;

    /// The venue-specific keepalive ping payload, or `None` if the venue
    /// relies on protocol-level WebSocket pings instead of an app-level one.
    fn ping_payload(&self) -> Option<String>;

    /// Venue's native symbol form, e.g. `btcusdt` -> `BTCUSDT` (Binance) or
    /// `BTC-USDT-SWAP` (OKX).
    fn to_venue_symbol(&self, symbol: &Symbol) -> String;
}

pub fn codec_for(venue: Venue) -> Box<dyn VenueCodec> {
    match venue {
        Venue::Binance => Box::new(binance::BinanceCodec),
        Venue::Bybit => Box::new(bybit::BybitCodec),
        Venue::Okx => Box::new(okx::OkxCodec),
    }
}

/// Parses a field that may arrive as either a JSON string or number.
pub(crate) fn parse_numeric(v: &serde_json::Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str().and_then(|s| s.parse::<f64>().ok())
}

pub(crate) fn parse_i64(v: &serde_json::Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    v.as_str().and_then(|s| s.parse::<i64>().ok())
}
