//! Combined-Stream Provider Codec
//!
//! # Stream URL
//!
//! Symbols active at connect time are embedded in the path:
//! `<base>/aapl@ticker/msft@ticker`. With no symbols the base URL is used
//! as is.
//!
//! # Protocol
//!
//! Subscription changes after connect:
//!
//! ```json
//! {"method":"SUBSCRIBE","params":["aapl@ticker"],"id":1}
//! ```
//!
//! Keepalive is keyed: `{"ping":42}` must be answered with `{"pong":42}`
//! before anything else is processed.
//!
//! Events are discriminated on `e` and may arrive wrapped as
//! `{"stream":"aapl@ticker","data":{...}}`. Numeric fields may be JSON
//! strings.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use super::{
    CodecError, Inbound, ProviderCodec, optional_decimal, optional_millis, required_decimal,
};
use crate::application::ports::Frame;
use crate::domain::quote::{Quote, Symbol, now_ms};
use crate::domain::streaming::ProviderId;

/// Stream suffix for the per-symbol ticker channel.
const TICKER_STREAM: &str = "@ticker";

/// Codec for the combined-stream provider.
#[derive(Debug)]
pub struct CombinedStreamCodec {
    next_request_id: AtomicU64,
}

impl Default for CombinedStreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CombinedStreamCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Stream name for a symbol.
    #[must_use]
    pub fn stream_name(symbol: &str) -> String {
        format!("{}{TICKER_STREAM}", symbol.to_lowercase())
    }

    fn control(&self, method: &str, symbols: &[Symbol]) -> Vec<Frame> {
        if symbols.is_empty() {
            return Vec::new();
        }

        let params: Vec<String> = symbols.iter().map(|s| Self::stream_name(s)).collect();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        vec![Frame::text(
            json!({"method": method, "params": params, "id": id}).to_string(),
        )]
    }

    fn decode_event(event: &Value) -> Result<Inbound, CodecError> {
        let Some(kind) = event.get("e").and_then(Value::as_str) else {
            if let Some(msg) = event.get("msg").and_then(Value::as_str) {
                return Ok(Inbound::error(msg));
            }
            return Ok(Inbound::default());
        };

        let quote = match kind {
            "24hrTicker" => {
                let mut quote = Quote::new(
                    Self::symbol(event)?,
                    required_decimal(event, "c", "price")?,
                    optional_millis(event, "E").unwrap_or_else(now_ms),
                );
                quote.change = optional_decimal(event, "p", "change")?;
                quote.change_percent = optional_decimal(event, "P", "change_percent")?;
                quote.day_high = optional_decimal(event, "h", "day_high")?;
                quote.day_low = optional_decimal(event, "l", "day_low")?;
                quote.volume = optional_decimal(event, "v", "volume")?;
                quote
            }
            "trade" => {
                let mut quote = Quote::new(
                    Self::symbol(event)?,
                    required_decimal(event, "p", "price")?,
                    optional_millis(event, "T")
                        .or_else(|| optional_millis(event, "E"))
                        .unwrap_or_else(now_ms),
                );
                quote.volume = optional_decimal(event, "q", "volume")?;
                quote
            }
            other => {
                tracing::trace!(event = other, "Ignoring combined-stream event");
                return Ok(Inbound::default());
            }
        };

        Ok(Inbound::quotes(vec![quote]))
    }

    fn symbol(event: &Value) -> Result<&str, CodecError> {
        event
            .get("s")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingField("symbol"))
    }
}

impl ProviderCodec for CombinedStreamCodec {
    fn provider(&self) -> ProviderId {
        ProviderId::CombinedStream
    }

    fn endpoint(&self, base_url: &str, symbols: &[Symbol]) -> String {
        if symbols.is_empty() {
            return base_url.to_string();
        }

        let path = symbols
            .iter()
            .map(|s| Self::stream_name(s))
            .collect::<Vec<_>>()
            .join("/");

        // Keep any query string (API token) after the path
        match base_url.split_once('?') {
            Some((base, query)) => format!("{}/{path}?{query}", base.trim_end_matches('/')),
            None => format!("{}/{path}", base_url.trim_end_matches('/')),
        }
    }

    fn embeds_subscriptions_in_url(&self) -> bool {
        true
    }

    fn encode_subscribe(&self, symbols: &[Symbol]) -> Vec<Frame> {
        self.control("SUBSCRIBE", symbols)
    }

    fn encode_unsubscribe(&self, symbols: &[Symbol]) -> Vec<Frame> {
        self.control("UNSUBSCRIBE", symbols)
    }

    fn decode(&self, frame: &Frame) -> Result<Inbound, CodecError> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => return Err(CodecError::UnsupportedFrame("binary")),
            Frame::Ping(_) | Frame::Pong(_) => return Ok(Inbound::default()),
        };

        let message: Value = serde_json::from_str(text)?;
        if !message.is_object() {
            return Err(CodecError::InvalidField {
                field: "message",
                reason: "expected a JSON object".to_string(),
            });
        }

        if let Some(key) = message.get("ping") {
            return Ok(Inbound::reply(Frame::text(json!({"pong": key}).to_string())));
        }

        // Subscription acknowledgement
        if message.get("result").is_some() && message.get("id").is_some() {
            return Ok(Inbound::default());
        }

        match message.get("data") {
            Some(data) if message.get("stream").is_some() => Self::decode_event(data),
            _ => Self::decode_event(&message),
        }
    }
}
