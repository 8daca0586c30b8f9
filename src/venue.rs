//! Venue identity and the per-venue static descriptor.
//!
//! The venue abstraction is a tagged enum plus a data descriptor rather than
//! an inheritance hierarchy: behavior that genuinely varies by venue
//! (decode, keepalive payload) lives behind the `VenueCodec` trait in
//! `codec/mod.rs`; behavior that is just *data* (endpoint, sequence field
//! name, ping interval) lives on `VenueDescriptor`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
}

impl Venue {
    pub const ALL: [Venue; 3] = [Venue::Binance, Venue::Bybit, Venue::Okx];

    pub const fn descriptor(self) -> VenueDescriptor {
        match self {
            Venue::Binance => VenueDescriptor {
                venue: Venue::Binance,
                ws_base: "wss://fstream.binance.com/stream",
                ping_interval: Duration::from_secs(20),
                heartbeat_timeout_factor: 3,
                subscribe_timeout: Duration::from_secs(10),
            },
            Venue::Bybit => VenueDescriptor {
                venue: Venue::Bybit,
                ws_base: "wss://stream.bybit.com/v5/public/linear",
                ping_interval: Duration::from_secs(20),
                heartbeat_timeout_factor: 3,
                subscribe_timeout: Duration::from_secs(10),
            },
            Venue::Okx => VenueDescriptor {
                venue: Venue::Okx,
                ws_base: "wss://ws.okx.com:8443/ws/v5/public",
                ping_interval: Duration::from_secs(20),
                heartbeat_timeout_factor: 3,
                subscribe_timeout: Duration::from_secs(10),
            },
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
        };
        write!(f, "{s}")
    }
}

/// Static, per-venue connection facts. Never mutated at runtime.
#[derive(Debug, Clone, Copy)]
pub struct VenueDescriptor {
    pub venue: Venue,
    pub ws_base: &'static str,
    pub ping_interval: Duration,
    pub heartbeat_timeout_factor: u32,
    pub subscribe_timeout: Duration,
}

impl VenueDescriptor {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.ping_interval * self.heartbeat_timeout_factor
    }
}

/// A canonical, lowercase symbol (e.g. `btcusdt`). Each venue has a bijective
/// mapping to/from this canonical form; the canonical form is the only key
/// used in publish topics and internal tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Builds a canonical symbol, lower-casing the input. Callers pass
    /// venue-native forms through the venue's `to_canonical` first.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Symbol(raw.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_is_canonicalized_lowercase() {
        assert_eq!(Symbol::new("BTCUSDT").as_str(), "btcusdt");
        assert_eq!(Symbol::from("BTC-USDT-SWAP"), Symbol::new("btc-usdt-swap"));
    }

    #[test]
    fn descriptor_heartbeat_timeout_is_triple_ping_interval() {
        let d = Venue::Binance.descriptor();
        assert_eq!(d.heartbeat_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn venue_display_matches_topic_convention() {
        assert_eq!(Venue::Binance.to_string(), "binance");
        assert_eq!(Venue::Bybit.to_string(), "bybit");
        assert_eq!(Venue::Okx.to_string(), "okx");
    }
}
