//! JSON-Control Provider Codec
//!
//! # Protocol
//!
//! Outbound, one text frame per symbol:
//!
//! ```json
//! {"type":"subscribe","symbol":"AAPL"}
//! {"type":"unsubscribe","symbol":"AAPL"}
//! ```
//!
//! Inbound messages are discriminated on `type`:
//!
//! ```json
//! {"type":"trade","data":[{"s":"AAPL","p":187.25,"t":1700000000000,"v":100}]}
//! {"type":"error","msg":"Subscribing to too many symbols"}
//! {"type":"ping"}
//! ```

use serde_json::{Value, json};

use super::{
    CodecError, Inbound, ProviderCodec, decimal_from_value, optional_decimal, optional_millis,
};
use crate::application::ports::Frame;
use crate::domain::quote::{Quote, Symbol, now_ms};
use crate::domain::streaming::ProviderId;

/// Codec for the JSON-control provider.
#[derive(Debug, Default, Clone)]
pub struct JsonControlCodec;

impl JsonControlCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn control(kind: &str, symbols: &[Symbol]) -> Vec<Frame> {
        symbols
            .iter()
            .map(|symbol| Frame::text(json!({"type": kind, "symbol": symbol}).to_string()))
            .collect()
    }

    fn decode_trades(message: &Value) -> Result<Vec<Quote>, CodecError> {
        let data = message
            .get("data")
            .and_then(Value::as_array)
            .ok_or(CodecError::MissingField("data"))?;

        let mut quotes = Vec::with_capacity(data.len());
        for entry in data {
            let symbol = entry.get("s").and_then(Value::as_str);
            let price = entry.get("p").and_then(decimal_from_value);

            let (Some(symbol), Some(price)) = (symbol, price) else {
                tracing::debug!(entry = %entry, "Skipping trade without symbol or price");
                continue;
            };

            let timestamp = optional_millis(entry, "t").unwrap_or_else(now_ms);
            let mut quote = Quote::new(symbol, price, timestamp);
            quote.volume = optional_decimal(entry, "v", "volume")?;
            quotes.push(quote);
        }

        Ok(quotes)
    }
}

impl ProviderCodec for JsonControlCodec {
    fn provider(&self) -> ProviderId {
        ProviderId::JsonControl
    }

    fn encode_subscribe(&self, symbols: &[Symbol]) -> Vec<Frame> {
        Self::control("subscribe", symbols)
    }

    fn encode_unsubscribe(&self, symbols: &[Symbol]) -> Vec<Frame> {
        Self::control("unsubscribe", symbols)
    }

    fn decode(&self, frame: &Frame) -> Result<Inbound, CodecError> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => return Err(CodecError::UnsupportedFrame("binary")),
            Frame::Ping(_) | Frame::Pong(_) => return Ok(Inbound::default()),
        };

        let message: Value = serde_json::from_str(text)?;
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingField("type"))?;

        match kind {
            "trade" => Ok(Inbound::quotes(Self::decode_trades(&message)?)),
            "error" => {
                let reason = message
                    .get("msg")
                    .or_else(|| message.get("message"))
                    .and_then(Value::as_str)
                    .map_or_else(|| message.to_string(), ToString::to_string);
                Ok(Inbound::error(reason))
            }
            _ => Ok(Inbound::default()),
        }
    }
}
