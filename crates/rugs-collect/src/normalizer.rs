//! Transport frame normalization.
//!
//! Maps raw text frames from the feed into canonical [`Event`]s. Two framings
//! are accepted:
//!
//! - Socket.IO v4 over Engine.IO: `0{..}` open, `2` ping, `40` namespace
//!   ack, `42["gameStateUpdate", {..}]` events.
//! - Plain JSON envelopes: `{"type": "gameStateUpdate", "data": {..}}`.
//!
//! Normalization never fails. Undecodable frames surface as
//! [`Frame::Malformed`] and payloads that fail shape validation are kept with
//! `valid = false`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use rugs_common::{Event, EventKind, counter_field, number_field};

/// Engine.IO pong reply to a server ping.
pub const PONG_FRAME: &str = "3";

/// Socket.IO connect request for the default namespace.
pub const NAMESPACE_CONNECT_FRAME: &str = "40";

/// A decoded transport frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A game event.
    Event(Event),
    /// Engine.IO handshake; the client must join the namespace.
    Open,
    /// Engine.IO ping; the client must answer with a pong.
    Ping,
    /// Server-initiated close at the protocol level.
    Close,
    /// Recognized protocol frame with nothing to do.
    Ignored,
    /// Could not be decoded at all.
    Malformed,
}

/// Trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// The fields of a trade payload the analytics rely on.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeView<'a> {
    pub participant: &'a str,
    pub side: TradeSide,
    pub quantity: f64,
    pub tick: Option<u64>,
}

impl<'a> TradeView<'a> {
    /// Extracts trade fields, or `None` if the payload lacks any required one.
    pub fn from_event(event: &'a Event) -> Option<Self> {
        if event.kind != EventKind::Trade {
            return None;
        }
        let payload = &event.payload;
        let participant = payload
            .get("playerId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())?;
        let side = payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(TradeSide::parse)?;
        let quantity = number_field(payload, "qty")
            .or_else(|| number_field(payload, "amount"))
            .filter(|q| *q >= 0.0)?;
        let tick = counter_field(payload, "tickIndex").or_else(|| counter_field(payload, "tick"));

        Some(Self {
            participant,
            side,
            quantity,
            tick,
        })
    }
}

/// Stateless frame decoder.
pub struct EventNormalizer;

impl EventNormalizer {
    /// Decode a text frame received at `received_at`.
    pub fn normalize(text: &str, received_at: DateTime<Utc>) -> Frame {
        let text = text.trim();
        match text.chars().next() {
            Some(c) if c.is_ascii_digit() => Self::from_socket_io(text, received_at),
            Some('{') => match serde_json::from_str::<Value>(text) {
                Ok(value) => Self::from_envelope(value, received_at),
                Err(_) => Frame::Malformed,
            },
            _ => Frame::Malformed,
        }
    }

    /// Build an event from a transport event name and payload, validating its shape.
    pub fn event(name: &str, payload: Value, received_at: DateTime<Utc>) -> Event {
        let mut event = Event::new(received_at, name, payload);
        event.valid = Self::validate(&event);
        event
    }

    /// Returns true if the payload has the shape its kind requires.
    pub fn validate(event: &Event) -> bool {
        match event.kind {
            EventKind::StateUpdate => validate_state_update(&event.payload),
            EventKind::Trade => TradeView::from_event(event).is_some(),
            EventKind::Other => true,
        }
    }

    fn from_socket_io(text: &str, received_at: DateTime<Utc>) -> Frame {
        let (packet_type, rest) = text.split_at(1);
        match packet_type {
            "0" => Frame::Open,
            "1" => Frame::Close,
            "2" => Frame::Ping,
            "3" | "5" | "6" => Frame::Ignored,
            "4" => Self::from_socket_io_message(rest, received_at),
            _ => Frame::Malformed,
        }
    }

    fn from_socket_io_message(body: &str, received_at: DateTime<Utc>) -> Frame {
        let Some(kind) = body.chars().next() else {
            return Frame::Malformed;
        };
        match kind {
            // connect ack, connect error, ack
            '0' | '3' | '4' => Frame::Ignored,
            '1' => Frame::Close,
            '2' => {
                // Optional "/namespace," and ack id precede the JSON array.
                let Some(start) = body.find('[') else {
                    return Frame::Malformed;
                };
                let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(&body[start..])
                else {
                    return Frame::Malformed;
                };
                if items.is_empty() {
                    return Frame::Malformed;
                }
                let payload = if items.len() > 1 {
                    items.swap_remove(1)
                } else {
                    Value::Null
                };
                match items.first().and_then(Value::as_str) {
                    Some(name) => Frame::Event(Self::event(name, payload, received_at)),
                    None => Frame::Malformed,
                }
            }
            _ => Frame::Malformed,
        }
    }

    fn from_envelope(mut value: Value, received_at: DateTime<Utc>) -> Frame {
        let name = value
            .get("type")
            .or_else(|| value.get("event"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(name) = name else {
            return Frame::Malformed;
        };

        let payload = ["data", "state", "payload"]
            .iter()
            .find_map(|key| value.get_mut(*key).map(Value::take))
            .unwrap_or(Value::Null);

        Frame::Event(Self::event(&name, payload, received_at))
    }
}

fn validate_state_update(payload: &Value) -> bool {
    let Some(object) = payload.as_object() else {
        return false;
    };
    let numeric_ok = ["price", "peakMultiplier"].iter().all(|field| {
        object
            .get(*field)
            .is_none_or(|v| v.is_null() || number_field(payload, field).is_some())
    });
    let tick_ok = object
        .get("tick")
        .is_none_or(|v| v.is_null() || counter_field(payload, "tick").is_some());
    let history_ok = object
        .get("gameHistory")
        .is_none_or(|v| v.is_null() || v.is_array());
    numeric_ok && tick_ok && history_ok
}
