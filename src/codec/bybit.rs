//! Bybit V5 public-linear codec.
//!
//! Topics: `publicTrade.<SYM>`, `orderbook.200.<SYM>`. Trade data arrives as
//! a JSON array; only element 0 is taken. Depth fields are
//! `b,a,u,seq`. A subscription ack is accepted on either `ret_msg ==
//! "SUCCESS"` or `success == true`; `op:"pong"` is consumed internally.

use log::warn;
use serde_json::Value;

use crate::codec::{parse_i64, parse_numeric, VenueCodec};
use crate::model::{BookDelta, ControlMsg, Event, Level, Side, Trade};
use crate::venue::{Symbol, Venue};

pub struct BybitCodec;

impl VenueCodec for BybitCodec {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn decode(&self, frame: &str) -> Vec<Event> {
        let parsed: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("[bybit] malformed frame dropped: {e}");
                return vec![];
            }
        };

        if let Some(op) = parsed.get("op").and_then(|v| v.as_str()) {
            return match op {
                "pong" => vec![Event::Control(ControlMsg::Pong)],
                "subscribe" => {
                    let ok = parsed
                        .get("ret_msg")
                        .and_then(|v| v.as_str())
                        .map(|s| s == "SUCCESS")
                        .unwrap_or(false)
                        || parsed
                            .get("success")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                    if ok {
                        vec![Event::Control(ControlMsg::SubscribeAck {
                            symbol: Symbol::new(""),
                        })]
                    } else {
                        let reason = parsed
                            .get("ret_msg")
                            .and_then(|v| v.as_str())
                            .unwrap_or("rejected")
                            .to_string();
                        vec![Event::Control(ControlMsg::SubscribeReject {
                            symbol: Symbol::new(""),
                            reason,
                        })]
                    }
                }
                _ => vec![],
            };
        }

        let topic = match parsed.get("topic").and_then(|v| v.as_str()) {
            Some(t) => t,
            None => {
                warn!("[bybit] unrecognized frame topic dropped");
                return vec![];
            }
        };

        if topic.starts_with("publicTrade.") {
            decode_trade(&parsed).into_iter().collect()
        } else if topic.starts_with("orderbook.") {
            decode_depth(&parsed).into_iter().collect()
        } else {
            warn!("[bybit] unrecognized topic '{topic}' dropped");
            vec![]
        }
    }

    fn subscribe_payloads(&self, symbol: &Symbol) -> Vec<String> {
        let sym = self.to_venue_symbol(symbol);
        vec![serde_json::json!({
            "op": "subscribe",
            "args": [format!("publicTrade.{sym}"), format!("orderbook.200.{sym}")],
        })
        .to_string()]
    }

    fn ping_payload(&self) -> Option<String> {
        Some(serde_json::json!({ "op": "ping" }).to_string())
    }

    fn to_venue_symbol(&self, symbol: &Symbol) -> String {
        symbol.as_str().to_uppercase()
    }
}

fn decode_trade(parsed: &Value) -> Option<Event> {
    let first = parsed.get("data")?.as_array()?.first()?;
    let symbol = first.get("s")?.as_str()?;
    let price = parse_numeric(first.get("p")?)?;
    let quantity = parse_numeric(first.get("v")?)?;
    let event_ts = parse_i64(first.get("T")?)?;
    let trade_id = first
        .get("i")
        .and_then(|v| v.as_str())
        .unwrap_or("0")
        .to_string();
    let side = match first.get("S").and_then(|v| v.as_str()) {
        Some("Buy") => Side::Buy,
        _ => Side::Sell,
    };

    Some(Event::Trade(Trade {
        venue: Venue::Bybit,
        symbol: Symbol::new(symbol),
        price,
        quantity,
        side,
        event_ts,
        trade_id,
    }))
}

fn decode_depth(parsed: &Value) -> Option<Event> {
    let data = parsed.get("data")?;
    let symbol = data.get("s")?.as_str()?;
    let seq = parse_i64(data.get("u")?)?;
    let event_ts = parse_i64(parsed.get("ts").unwrap_or(&Value::Null)).unwrap_or(0);
    let bids = levels_from(data.get("b")?);
    let asks = levels_from(data.get("a")?);

    Some(Event::BookDelta(BookDelta {
        venue: Venue::Bybit,
        symbol: Symbol::new(symbol),
        bids,
        asks,
        first_seq: seq,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_trade_taking_only_first_array_element() {
        let codec = BybitCodec;
        let frame = serde_json::json!({
            "topic": "publicTrade.BTCUSDT",
            "data": [
                {"s": "BTCUSDT", "p": "50000", "v": "1.0", "T": 1, "i": "a1", "S": "Buy"},
                {"s": "BTCUSDT", "p": "50001", "v": "2.0", "T": 2, "i": "a2", "S": "Sell"}
            ]
        })
        .to_string();

        let events = codec.decode(&frame);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Trade(t) => assert_eq!(t.price, 50000.0),
            _ => panic!("expected trade"),
        }
    }

    #[test]
    fn subscribe_ack_accepts_either_ret_msg_or_success_flag() {
        let codec = BybitCodec;
        let a = codec.decode(&serde_json::json!({"op":"subscribe","ret_msg":"SUCCESS"}).to_string());
        let b = codec.decode(&serde_json::json!({"op":"subscribe","success":true}).to_string());
        assert!(matches!(a[0], Event::Control(ControlMsg::SubscribeAck { .. })));
        assert!(matches!(b[0], Event::Control(ControlMsg::SubscribeAck { .. })));
    }

    #[test]
    fn pong_op_is_consumed_as_control() {
        let codec = BybitCodec;
        let events = codec.decode(&serde_json::json!({"op":"pong"}).to_string());
        assert!(matches!(events[0], Event::Control(ControlMsg::Pong)));
    }
}
