//! Binance Futures codec.
//!
//! `fstream` combined stream: `stream?streams=<sym>@trade/<sym>@depth@100ms`.
//! Trade fields `p,q,T,m,t`; depth fields `U,u,b,a`; sequence = `u`.
//! `m == true` means the buyer is the maker, so the taker side is sell.

use log::warn;
use serde_json::Value;

use crate::codec::{parse_i64, parse_numeric, VenueCodec};
use crate::model::{BookDelta, ControlMsg, Event, Level, Side, Trade};
use crate::venue::{Symbol, Venue};

pub struct BinanceCodec;

impl VenueCodec for BinanceCodec {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn decode(&self, frame: &str) -> Vec<Event> {
        let parsed: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("[binance] malformed frame dropped: {e}");
                return vec![];
            }
        };

        // Combined-stream envelope wraps the payload under "data"; single
        // raw streams do not. Accept both.
        let data = parsed.get("data").unwrap_or(&parsed);

        let event_type = data.get("e").and_then(|v| v.as_str()).unwrap_or("");
        match event_type {
            "trade" => decode_trade(data).into_iter().collect(),
            "depthUpdate" => decode_depth(data).into_iter().collect(),
            "" => {
                if data.get("result").is_some() || parsed.get("id").is_some() {
                    vec![Event::Control(ControlMsg::SubscribeAck {
                        symbol: Symbol::new(""),
                    })]
                } else {
                    warn!("[binance] unrecognized frame topic dropped");
                    vec![]
                }
            }
            other => {
                warn!("[binance] unrecognized event type '{other}' dropped");
                vec![]
            }
        }
    }

    fn subscribe_payloads(&self, symbol: &Symbol) -> Vec<String> {
        let sym = self.to_venue_symbol(symbol).to_lowercase();
        vec![serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [format!("{sym}@trade"), format!("{sym}@depth@100ms")],
            "id": 1,
        })
        .to_string()]
    }

    fn ping_payload(&self) -> Option<String> {
        // Binance answers protocol-level pings with pongs automatically via
        // tokio-tungstenite; no application-level ping frame is required.
        None
    }

    fn to_venue_symbol(&self, symbol: &Symbol) -> String {
        symbol.as_str().to_uppercase()
    }
}

fn decode_trade(data: &Value) -> Option<Event> {
    let symbol = data.get("s")?.as_str()?;
    let price = parse_numeric(data.get("p")?)?;
    let quantity = parse_numeric(data.get("q")?)?;
    let event_ts = parse_i64(data.get("T")?)?;
    let trade_id = data
        .get("t")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "0".into());
    let is_buyer_maker = data.get("m").and_then(|v| v.as_bool()).unwrap_or(false);
    let side = if is_buyer_maker { Side::Sell } else { Side::Buy };

    Some(Event::Trade(Trade {
        venue: Venue::Binance,
        symbol: Symbol::new(symbol),
        price,
        quantity,
        side,
        event_ts,
        trade_id,
    }))
}

fn decode_depth(data: &Value) -> Option<Event> {
    let symbol = data.get("s")?.as_str()?;
    let first_seq = parse_i64(data.get("U")?)?;
    let final_seq = parse_i64(data.get("u")?)?;
    let event_ts = parse_i64(data.get("E").unwrap_or(&Value::Null)).unwrap_or(0);
    let bids = levels_from(data.get("b")?);
    let asks = levels_from(data.get("a")?);

    Some(Event::BookDelta(BookDelta {
        venue: Venue::Binance,
        symbol: Symbol::new(symbol),
        bids,
        asks,
        first_seq,
        final_seq,
        event_ts,
    }))
}

fn levels_from(arr: &Value) -> Vec<Level> {
    arr.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|lvl| {
                    let pair = lvl.as_array()?;
                    let price = parse_numeric(pair.first()?)?;
                    let qty = parse_numeric(pair.get(1)?)?;
                    Some(Level { price, qty })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_trade_with_buyer_maker_as_sell() {
        let codec = BinanceCodec;
        let frame = serde_json::json!({
            "stream": "btcusdt@trade",
            "data": {
                "e": "trade", "s": "BTCUSDT", "p": "50000.5", "q": "1.2",
                "T": 1_700_000_000_000i64, "t": 12345, "m": true
            }
        })
        .to_string();

        let events = codec.decode(&frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Trade(t) => {
                assert_eq!(t.price, 50000.5);
                assert_eq!(t.quantity, 1.2);
                assert_eq!(t.side, Side::Sell);
                assert_eq!(t.symbol.as_str(), "btcusdt");
            }
            _ => panic!("expected trade"),
        }
    }

    #[test]
    fn decodes_depth_update_sequence_from_u_field() {
        let codec = BinanceCodec;
        let frame = serde_json::json!({
            "data": {
                "e": "depthUpdate", "s": "BTCUSDT", "U": 100, "u": 103, "E": 1,
                "b": [["49900.0", "1.5"]], "a": [["50100.0", "0.0"]]
            }
        })
        .to_string();

        let events = codec.decode(&frame);
        match &events[0] {
            Event::BookDelta(d) => {
                assert_eq!(d.first_seq, 100);
                assert_eq!(d.final_seq, 103);
                assert_eq!(d.asks[0].qty, 0.0);
            }
            _ => panic!("expected book delta"),
        }
    }

    #[test]
    fn malformed_frame_is_dropped_not_errored() {
        let codec = BinanceCodec;
        assert!(codec.decode("not json").is_empty());
    }

    #[test]
    fn venue_symbol_is_uppercase_no_separator() {
        let codec = BinanceCodec;
        assert_eq!(codec.to_venue_symbol(&Symbol::new("btcusdt")), "BTCUSDT");
    }
}
