//! OKX public codec.
//!
//! `/ws/v5/public`, channels `trades` and `books` (400-level). Perp symbols
//! use `BASE-QUOTE-SWAP`. Sequence is `seqId` (falls back to `seq`). The
//! server sends the literal text `ping`; we must answer the literal text
//! `pong` — neither frame is JSON, so they are checked before parsing.
//!
//! OKX's `books` channel never tags a frame as a snapshot explicitly: by
//! convention the first `books` frame after subscribe is treated as a full
//! snapshot (`action` absent, or `"snapshot"`); subsequent frames with
//! `action:"update"` are incremental deltas. The order-book registry is
//! responsible for actually merging a snapshot-tagged delta wholesale; the
//! codec just passes `first_seq`/`final_seq` through untouched either way.

use log::warn;
use serde_json::Value;

use crate::codec::{parse_i64, parse_numeric, VenueCodec};
use crate::model::{BookDelta, ControlMsg, Event, Level, Side, Trade};
use crate::venue::{Symbol, Venue};

const KNOWN_QUOTES: &[&str] = &["usdt", "usdc", "busd", "usd", "btc", "eth"];

pub struct OkxCodec;

impl VenueCodec for OkxCodec {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn decode(&self, frame: &str) -> Vec<Event> {
        let trimmed = frame.trim();
        if trimmed == "ping" {
            return vec![Event::Control(ControlMsg::Ping)];
        }
        if trimmed == "pong" {
            return vec![Event::Control(ControlMsg::Pong)];
        }

        let parsed: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("[okx] malformed frame dropped: {e}");
                return vec![];
            }
        };

        if let Some(event) = parsed.get("event").and_then(|v| v.as_str()) {
            return match event {
                "subscribe" => vec![Event::Control(ControlMsg::SubscribeAck {
                    symbol: Symbol::new(""),
                })],
                "error" => {
                    let reason = parsed
                        .get("msg")
                        .and_then(|v| v.as_str())
                        .unwrap_or("rejected")
                        .to_string();
                    vec![Event::Control(ControlMsg::SubscribeReject {
                        symbol: Symbol::new(""),
                        reason,
                    })]
                }
                _ => vec![],
            };
        }

        let channel = match parsed.get("arg").and_then(|a| a.get("channel")).and_then(|c| c.as_str()) {
            Some(c) => c,
            None => {
                warn!("[okx] unrecognized frame topic dropped");
                return vec![];
            }
        };

        match channel {
            "trades" => decode_trades(&parsed),
            "books" => decode_books(&parsed).into_iter().collect(),
            other => {
                warn!("[okx] unrecognized channel '{other}' dropped");
                vec![]
            }
        }
    }

    fn subscribe_payloads(&self, symbol: &Symbol) -> Vec<String> {
        let sym = self.to_venue_symbol(symbol);
        vec![serde_json::json!({
            "op": "subscribe",
            "args": [
                {"channel": "trades", "instId": sym},
                {"channel": "books", "instId": sym},
            ],
        })
        .to_string()]
    }

    fn ping_payload(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn to_venue_symbol(&self, symbol: &Symbol) -> String {
        let raw = symbol.as_str();
        for quote in KNOWN_QUOTES {
            if raw.ends_with(quote) && raw.len() > quote.len() {
                let base = &raw[..raw.len() - quote.len()];
                return format!("{}-{}-SWAP", base.to_uppercase(), quote.to_uppercase());
            }
        }
        format!("{}-SWAP", raw.to_uppercase())
    }
}

fn decode_trades(parsed: &Value) -> Vec<Event> {
    let inst_id = match parsed.get("arg").and_then(|a| a.get("instId")).and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return vec![],
    };
    let symbol = from_venue_symbol(inst_id);

    parsed
        .get("data")
        .and_then(|d| d.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let price = parse_numeric(row.get("px")?)?;
                    let quantity = parse_numeric(row.get("sz")?)?;
                    let event_ts = parse_i64(row.get("ts")?)?;
                    let trade_id = row
                        .get("tradeId")
                        .and_then(|v| v.as_str())
                        .unwrap_or("0")
                        .to_string();
                    let side = match row.get("side").and_then(|v| v.as_str()) {
                        Some("buy") => Side::Buy,
                        _ => Side::Sell,
                    };
                    Some(Event::Trade(Trade {
                        venue: Venue::Okx,
                        symbol: symbol.clone(),
                        price,
                        quantity,
                        side,
                        event_ts,
                        trade_id,
                    }))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn decode_books(parsed: &Value) -> Option<Event> {
    let inst_id = parsed.get("arg")?.get("instId")?.as_str()?;
    let symbol = from_venue_symbol(inst_id);
    let row = parsed.get("data")?.as_array()?.first()?;

    let event_ts = parse_i64(row.get("ts")?)?;
    let seq = row
        .get("seqId")
        .or_else(|| row.get("seq"))
        .and_then(parse_i64)
        .unwrap_or(0);
    let prev_seq = row.get("prevSeqId").and_then(parse_i64).unwrap_or(seq - 1);
    let bids = levels_from(row.get("bids")?);
    let asks = levels_from(row.get("asks")?);

    Some(Event::BookDelta(BookDelta {
        venue: Venue::Okx,
        symbol,
        bids,
        asks,
        first_seq: prev_seq + 1,
        final_seq: seq,
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

fn from_venue_symbol(inst_id: &str) -> Symbol {
    Symbol::new(inst_id.trim_end_matches("-SWAP").replace('-', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_ping_text_is_handled_before_json_parse() {
        let codec = OkxCodec;
        assert!(matches!(
            codec.decode("ping")[0],
            Event::Control(ControlMsg::Ping)
        ));
    }

    #[test]
    fn to_venue_symbol_produces_base_quote_swap() {
        let codec = OkxCodec;
        assert_eq!(codec.to_venue_symbol(&Symbol::new("btcusdt")), "BTC-USDT-SWAP");
    }

    #[test]
    fn decodes_books_snapshot_with_seq_id() {
        let codec = OkxCodec;
        let frame = serde_json::json!({
            "arg": {"channel": "books", "instId": "BTC-USDT-SWAP"},
            "action": "snapshot",
            "data": [{
                "asks": [["50100.0", "2.0", "0", "1"]],
                "bids": [["49900.0", "3.0", "0", "1"]],
                "ts": "1700000000000",
                "seqId": 1000
            }]
        })
        .to_string();

        let events = codec.decode(&frame);
        match &events[0] {
            Event::BookDelta(d) => {
                assert_eq!(d.final_seq, 1000);
                assert_eq!(d.symbol.as_str(), "btcusdt");
            }
            _ => panic!("expected book delta"),
        }
    }
}
