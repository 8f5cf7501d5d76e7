//! Provider Codecs
//!
//! Each upstream provider speaks its own wire format. A codec turns
//! subscription intents into outbound frames and inbound frames into
//! canonical [`Quote`]s:
//!
//! - **JSON-control**: per-symbol `{"type":"subscribe"}` control messages,
//!   `trade` events carrying a `data` array
//! - **Combined-stream**: subscriptions embedded in the URL path, JSON
//!   control for changes, keyed `{"ping":n}` / `{"pong":n}` keepalive
//! - **Binary-frame**: tag-length-value binary records with a JSON text
//!   fallback on the same channel

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::application::ports::Frame;
use crate::domain::quote::{Quote, Symbol};
use crate::domain::streaming::ProviderId;

pub mod binary_frame;
pub mod combined_stream;
pub mod json_control;
mod reader;

pub use binary_frame::BinaryFrameCodec;
pub use combined_stream::CombinedStreamCodec;
pub use json_control::JsonControlCodec;
pub use reader::FrameReader;

// =============================================================================
// Error Type
// =============================================================================

/// Errors raised while decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON parsing failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A binary field ran past the end of the frame.
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },

    /// A field was present but unusable.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The provider does not use this kind of frame.
    #[error("unsupported {0} frame")]
    UnsupportedFrame(&'static str),
}

impl CodecError {
    /// Short label used as a metrics dimension.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Truncated { .. } => "truncated",
            Self::InvalidField { .. } => "invalid_field",
            Self::MissingField(_) => "missing_field",
            Self::UnsupportedFrame(_) => "unsupported_frame",
        }
    }
}

// =============================================================================
// Decoded Frame
// =============================================================================

/// Everything a single inbound frame produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inbound {
    /// Frame to write back before anything else is processed (keyed pong).
    pub reply: Option<Frame>,
    /// Quotes in wire order.
    pub quotes: Vec<Quote>,
    /// Error message reported by the provider.
    pub error: Option<String>,
}

impl Inbound {
    /// Inbound carrying quotes.
    #[must_use]
    pub const fn quotes(quotes: Vec<Quote>) -> Self {
        Self {
            reply: None,
            quotes,
            error: None,
        }
    }

    /// Inbound that only needs a reply.
    #[must_use]
    pub const fn reply(frame: Frame) -> Self {
        Self {
            reply: Some(frame),
            quotes: Vec::new(),
            error: None,
        }
    }

    /// Inbound carrying a provider error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            reply: None,
            quotes: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Check if the frame produced nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reply.is_none() && self.quotes.is_empty() && self.error.is_none()
    }
}

// =============================================================================
// Codec Trait
// =============================================================================

/// Wire format of one upstream provider.
pub trait ProviderCodec: Send + Sync + std::fmt::Debug {
    /// Provider this codec speaks for.
    fn provider(&self) -> ProviderId;

    /// URL to open given the configured base URL and the symbols that are
    /// active at connect time.
    fn endpoint(&self, base_url: &str, symbols: &[Symbol]) -> String {
        let _ = symbols;
        base_url.to_string()
    }

    /// Check if [`ProviderCodec::endpoint`] already subscribes the symbols
    /// it was given.
    fn embeds_subscriptions_in_url(&self) -> bool {
        false
    }

    /// Frames that subscribe to `symbols`.
    fn encode_subscribe(&self, symbols: &[Symbol]) -> Vec<Frame>;

    /// Frames that unsubscribe from `symbols`.
    fn encode_unsubscribe(&self, symbols: &[Symbol]) -> Vec<Frame>;

    /// Frame sent when the keepalive interval elapses.
    fn keepalive(&self) -> Frame {
        Frame::Ping(Vec::new())
    }

    /// Decode one inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the frame is malformed. A malformed frame
    /// yields no quotes.
    fn decode(&self, frame: &Frame) -> Result<Inbound, CodecError>;

    /// Decode one inbound frame, logging and discarding malformed input.
    fn decode_lossy(&self, frame: &Frame) -> Inbound {
        match self.decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(
                    provider = %self.provider(),
                    frame = frame.kind(),
                    error = %e,
                    "Dropping malformed frame"
                );
                Inbound::default()
            }
        }
    }
}

/// Codec for a provider.
#[must_use]
pub fn codec_for(provider: ProviderId) -> Arc<dyn ProviderCodec> {
    match provider {
        ProviderId::JsonControl => Arc::new(JsonControlCodec::new()),
        ProviderId::CombinedStream => Arc::new(CombinedStreamCodec::new()),
        ProviderId::BinaryFrame => Arc::new(BinaryFrameCodec::new()),
    }
}

// =============================================================================
// JSON Helpers
// =============================================================================

/// Read a decimal from a JSON number or numeric string.
///
/// Accepts plain and scientific notation. Returns `None` for anything else.
#[must_use]
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };

    text.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(&text).ok())
}

/// Read an optional decimal field.
///
/// Absent and `null` fields are `None`; any other non-numeric value is an
/// error.
pub(crate) fn optional_decimal(
    object: &Value,
    key: &str,
    field: &'static str,
) -> Result<Option<Decimal>, CodecError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decimal_from_value(value)
            .map(Some)
            .ok_or_else(|| CodecError::InvalidField {
                field,
                reason: format!("expected a number, got {value}"),
            }),
    }
}

/// Read a required decimal field.
pub(crate) fn required_decimal(
    object: &Value,
    key: &str,
    field: &'static str,
) -> Result<Decimal, CodecError> {
    optional_decimal(object, key, field)?.ok_or(CodecError::MissingField(field))
}

/// Read an epoch-millisecond field given as a number or numeric string.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn optional_millis(object: &Value, key: &str) -> Option<i64> {
    match object.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case(json!(187.25), Some(Decimal::new(18725, 2)) ; "number")]
    #[test_case(json!("187.25"), Some(Decimal::new(18725, 2)) ; "numeric string")]
    #[test_case(json!(" 42 "), Some(Decimal::from(42)) ; "padded string")]
    #[test_case(json!("1.5e2"), Some(Decimal::from(150)) ; "scientific string")]
    #[test_case(json!("abc"), None ; "non numeric string")]
    #[test_case(json!(true), None ; "boolean")]
    #[test_case(json!(null), None ; "null")]
    fn decimal_from_json(value: Value, expected: Option<Decimal>) {
        assert_eq!(decimal_from_value(&value), expected);
    }

    #[test]
    fn optional_decimal_distinguishes_absent_from_invalid() {
        let object = json!({"a": null, "b": "x", "c": 1});

        assert_eq!(optional_decimal(&object, "a", "a").unwrap(), None);
        assert_eq!(optional_decimal(&object, "missing", "missing").unwrap(), None);
        assert!(matches!(
            optional_decimal(&object, "b", "b"),
            Err(CodecError::InvalidField { field: "b", .. })
        ));
        assert_eq!(optional_decimal(&object, "c", "c").unwrap(), Some(Decimal::ONE));
    }

    #[test]
    fn millis_accepts_numbers_and_strings() {
        let object = json!({"t": 1_700_000_000_000_i64, "s": "1700000000001", "x": []});
        assert_eq!(optional_millis(&object, "t"), Some(1_700_000_000_000));
        assert_eq!(optional_millis(&object, "s"), Some(1_700_000_000_001));
        assert_eq!(optional_millis(&object, "x"), None);
    }

    #[test]
    fn every_provider_has_a_codec() {
        for provider in ProviderId::all() {
            assert_eq!(codec_for(*provider).provider(), *provider);
        }
    }

    #[test]
    fn decode_lossy_swallows_errors() {
        let codec = codec_for(ProviderId::JsonControl);
        let inbound = codec.decode_lossy(&Frame::text("{not json"));
        assert!(inbound.is_empty());
    }
}
