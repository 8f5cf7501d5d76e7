//! Binary-Frame Provider Codec
//!
//! # Binary Format
//!
//! A binary frame is a sequence of tag-length-value fields:
//!
//! ```text
//! +--------+-------------+-----------------+
//! | tag u8 | len u16 LE  | value (len)     |
//! +--------+-------------+-----------------+
//! ```
//!
//! | Tag    | Field          | Value                                 |
//! |--------|----------------|---------------------------------------|
//! | `0x01` | symbol         | ASCII, starts a new record            |
//! | `0x02` | price          | f32 LE                                |
//! | `0x03` | timestamp      | i64 LE epoch milliseconds             |
//! | `0x04` | change         | f32 LE                                |
//! | `0x05` | change percent | f32 LE                                |
//! | `0x06` | day high       | f32 LE                                |
//! | `0x07` | day low        | f32 LE                                |
//! | `0x08` | volume         | u64 LE                                |
//! | `0x09` | session        | u8: 0 regular, 1 pre, 2 post, 3 closed|
//!
//! Unknown tags are skipped by length. A frame may carry several records.
//! Any malformed field rejects the whole frame.
//!
//! # Text Frames
//!
//! - Control: `{"subscribe":["AAPL"]}` / `{"unsubscribe":["AAPL"]}`
//! - Keepalive: `{"type":"ping"}`, answered by `{"type":"pong"}`
//! - JSON fallback: an object or array of
//!   `{symbol, price, change, changePercent, dayHigh, dayLow, volume, time, session}`

use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::{
    CodecError, FrameReader, Inbound, ProviderCodec, decimal_from_value, optional_decimal,
    optional_millis,
};
use crate::application::ports::Frame;
use crate::domain::quote::{MarketSession, Quote, Symbol, decimal_from_f32, now_ms};
use crate::domain::streaming::ProviderId;

/// Field tags.
pub mod tag {
    /// Instrument symbol.
    pub const SYMBOL: u8 = 0x01;
    /// Last price.
    pub const PRICE: u8 = 0x02;
    /// Event time in epoch milliseconds.
    pub const TIMESTAMP: u8 = 0x03;
    /// Absolute change.
    pub const CHANGE: u8 = 0x04;
    /// Percent change.
    pub const CHANGE_PERCENT: u8 = 0x05;
    /// Session high.
    pub const DAY_HIGH: u8 = 0x06;
    /// Session low.
    pub const DAY_LOW: u8 = 0x07;
    /// Volume.
    pub const VOLUME: u8 = 0x08;
    /// Market session code.
    pub const SESSION: u8 = 0x09;
}

/// Keepalive frame sent by the client.
const PING: &str = r#"{"type":"ping"}"#;

/// Reply to a server-initiated ping.
const PONG: &str = r#"{"type":"pong"}"#;

/// Codec for the binary-frame provider.
#[derive(Debug, Default, Clone)]
pub struct BinaryFrameCodec;

/// Fields collected for one record.
#[derive(Debug)]
struct PartialQuote {
    symbol: Symbol,
    price: Option<Decimal>,
    timestamp_ms: Option<i64>,
    change: Option<Decimal>,
    change_percent: Option<Decimal>,
    day_high: Option<Decimal>,
    day_low: Option<Decimal>,
    volume: Option<Decimal>,
    session: Option<MarketSession>,
}

impl PartialQuote {
    const fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            price: None,
            timestamp_ms: None,
            change: None,
            change_percent: None,
            day_high: None,
            day_low: None,
            volume: None,
            session: None,
        }
    }

    fn finish(self) -> Result<Quote, CodecError> {
        let price = self.price.ok_or(CodecError::MissingField("price"))?;
        let mut quote = Quote::new(self.symbol, price, self.timestamp_ms.unwrap_or_else(now_ms));
        quote.change = self.change;
        quote.change_percent = self.change_percent;
        quote.day_high = self.day_high;
        quote.day_low = self.day_low;
        quote.volume = self.volume;
        quote.session = self.session;
        Ok(quote)
    }
}

impl BinaryFrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode the tag-length-value records of a binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if any field is truncated or invalid, or a
    /// record lacks a price.
    pub fn decode_records(bytes: &[u8]) -> Result<Vec<Quote>, CodecError> {
        let mut reader = FrameReader::new(bytes);
        let mut quotes = Vec::new();
        let mut current: Option<PartialQuote> = None;

        while !reader.is_empty() {
            let tag = reader.read_u8("tag")?;
            let len = usize::from(reader.read_u16_le("length")?);
            let field = field_name(tag);
            let mut value = FrameReader::new(reader.read_bytes(field, len)?);

            if tag == tag::SYMBOL {
                if let Some(done) = current.take() {
                    quotes.push(done.finish()?);
                }
                current = Some(PartialQuote::new(read_symbol(value.read_bytes(field, len)?)?));
                continue;
            }

            if !(tag::PRICE..=tag::SESSION).contains(&tag) {
                tracing::trace!(tag, len, "Skipping unknown binary field");
                continue;
            }

            let record = current.as_mut().ok_or(CodecError::MissingField("symbol"))?;
            match tag {
                tag::PRICE => record.price = Some(read_price(&mut value, field, len)?),
                tag::TIMESTAMP => {
                    expect_len(field, len, 8)?;
                    record.timestamp_ms = Some(value.read_i64_le(field)?);
                }
                tag::CHANGE => record.change = Some(read_price(&mut value, field, len)?),
                tag::CHANGE_PERCENT => {
                    record.change_percent = Some(read_price(&mut value, field, len)?);
                }
                tag::DAY_HIGH => record.day_high = Some(read_price(&mut value, field, len)?),
                tag::DAY_LOW => record.day_low = Some(read_price(&mut value, field, len)?),
                tag::VOLUME => {
                    expect_len(field, len, 8)?;
                    record.volume = Some(Decimal::from(value.read_u64_le(field)?));
                }
                _ => {
                    expect_len(field, len, 1)?;
                    let code = value.read_u8(field)?;
                    record.session =
                        Some(MarketSession::from_code(code).ok_or_else(|| CodecError::InvalidField {
                            field,
                            reason: format!("unknown session code {code}"),
                        })?);
                }
            }
        }

        if let Some(done) = current {
            quotes.push(done.finish()?);
        }

        Ok(quotes)
    }

    fn decode_text(text: &str) -> Result<Inbound, CodecError> {
        let message: Value = serde_json::from_str(text)?;

        match &message {
            Value::Array(items) => Ok(Inbound::quotes(
                items.iter().filter_map(json_quote).collect(),
            )),
            Value::Object(_) => match message.get("type").and_then(Value::as_str) {
                Some("ping") => Ok(Inbound::reply(Frame::text(PONG))),
                Some("error") => Ok(Inbound::error(
                    message
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified provider error"),
                )),
                Some(_) => Ok(Inbound::default()),
                None => Ok(Inbound::quotes(json_quote(&message).into_iter().collect())),
            },
            _ => Err(CodecError::InvalidField {
                field: "message",
                reason: "expected a JSON object or array".to_string(),
            }),
        }
    }
}

impl ProviderCodec for BinaryFrameCodec {
    fn provider(&self) -> ProviderId {
        ProviderId::BinaryFrame
    }

    fn encode_subscribe(&self, symbols: &[Symbol]) -> Vec<Frame> {
        if symbols.is_empty() {
            return Vec::new();
        }
        vec![Frame::text(json!({ "subscribe": symbols }).to_string())]
    }

    fn encode_unsubscribe(&self, symbols: &[Symbol]) -> Vec<Frame> {
        if symbols.is_empty() {
            return Vec::new();
        }
        vec![Frame::text(json!({ "unsubscribe": symbols }).to_string())]
    }

    fn keepalive(&self) -> Frame {
        Frame::text(PING)
    }

    fn decode(&self, frame: &Frame) -> Result<Inbound, CodecError> {
        match frame {
            Frame::Binary(bytes) => Self::decode_records(bytes).map(Inbound::quotes),
            Frame::Text(text) => Self::decode_text(text),
            Frame::Ping(_) | Frame::Pong(_) => Ok(Inbound::default()),
        }
    }
}

const fn field_name(tag: u8) -> &'static str {
    match tag {
        tag::SYMBOL => "symbol",
        tag::PRICE => "price",
        tag::TIMESTAMP => "timestamp",
        tag::CHANGE => "change",
        tag::CHANGE_PERCENT => "change_percent",
        tag::DAY_HIGH => "day_high",
        tag::DAY_LOW => "day_low",
        tag::VOLUME => "volume",
        tag::SESSION => "session",
        _ => "unknown",
    }
}

fn expect_len(field: &'static str, len: usize, expected: usize) -> Result<(), CodecError> {
    if len == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidField {
            field,
            reason: format!("expected {expected} bytes, got {len}"),
        })
    }
}

fn read_price(value: &mut FrameReader<'_>, field: &'static str, len: usize) -> Result<Decimal, CodecError> {
    expect_len(field, len, 4)?;
    let raw = value.read_f32_le(field)?;
    decimal_from_f32(raw).ok_or_else(|| CodecError::InvalidField {
        field,
        reason: format!("non-finite value {raw}"),
    })
}

fn read_symbol(bytes: &[u8]) -> Result<Symbol, CodecError> {
    let invalid = |reason: &str| CodecError::InvalidField {
        field: "symbol",
        reason: reason.to_string(),
    };

    if bytes.is_empty() {
        return Err(invalid("empty"));
    }
    if !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return Err(invalid("not printable ASCII"));
    }
    std::str::from_utf8(bytes)
        .map(ToString::to_string)
        .map_err(|_| invalid("not UTF-8"))
}

/// Quote from a JSON fallback record; records without symbol or price are
/// skipped.
fn json_quote(record: &Value) -> Option<Quote> {
    let symbol = record.get("symbol").and_then(Value::as_str)?;
    let price = record.get("price").and_then(decimal_from_value)?;
    let timestamp = json_time(record).unwrap_or_else(now_ms);

    let mut quote = Quote::new(symbol, price, timestamp);
    quote.change = optional_decimal(record, "change", "change").ok().flatten();
    quote.change_percent = optional_decimal(record, "changePercent", "change_percent")
        .ok()
        .flatten();
    quote.day_high = optional_decimal(record, "dayHigh", "day_high").ok().flatten();
    quote.day_low = optional_decimal(record, "dayLow", "day_low").ok().flatten();
    quote.volume = optional_decimal(record, "volume", "volume").ok().flatten();
    quote.session = record
        .get("session")
        .and_then(Value::as_str)
        .and_then(MarketSession::from_label);
    Some(quote)
}

/// Event time as epoch milliseconds or an RFC 3339 string.
fn json_time(record: &Value) -> Option<i64> {
    optional_millis(record, "time").or_else(|| {
        record
            .get("time")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.timestamp_millis())
    })
}
