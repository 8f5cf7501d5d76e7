//! Canonical Quote Model
//!
//! The provider-agnostic price update that every codec normalizes into.
//!
//! Only `symbol`, `price` and `timestamp_ms` are guaranteed. Every other
//! field is optional and `None` means "unknown", never zero. Prices are
//! `Decimal`, so a quote can never carry a NaN or infinite price.

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};

/// A symbol string (exchange-qualified identifier or plain ticker).
pub type Symbol = String;

/// Latest quote per symbol, as exposed to consumers.
pub type QuoteMap = HashMap<Symbol, Quote>;

// =============================================================================
// Market Session
// =============================================================================

/// Trading session the quote was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketSession {
    /// Regular trading hours.
    Regular,
    /// Pre-market session.
    Pre,
    /// Post-market (after hours) session.
    Post,
    /// Market closed.
    Closed,
}

impl MarketSession {
    /// Parse a session label, accepting the common long forms.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "regular" | "regular_market" | "open" => Some(Self::Regular),
            "pre" | "pre_market" | "premarket" => Some(Self::Pre),
            "post" | "post_market" | "postmarket" | "after_hours" => Some(Self::Post),
            "closed" | "close" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Map the one-byte wire code used by the binary feed.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Regular),
            1 => Some(Self::Pre),
            2 => Some(Self::Post),
            3 => Some(Self::Closed),
            _ => None,
        }
    }

    /// Get the session name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Pre => "pre",
            Self::Post => "post",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for MarketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Quote
// =============================================================================

/// Canonical quote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument identifier.
    pub symbol: Symbol,
    /// Last price.
    pub price: Decimal,
    /// Absolute move since the reference price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Decimal>,
    /// Relative move since the reference price, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<Decimal>,
    /// Session high.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_high: Option<Decimal>,
    /// Session low.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_low: Option<Decimal>,
    /// Traded volume (trade size for trade events, session volume for tickers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// Event time in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Market session indicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<MarketSession>,
}

impl Quote {
    /// Create a quote carrying only the required fields.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, price: Decimal, timestamp_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            change: None,
            change_percent: None,
            day_high: None,
            day_low: None,
            volume: None,
            timestamp_ms,
            session: None,
        }
    }

    /// Create a quote from a floating point price.
    ///
    /// Returns `None` when the price is NaN or infinite.
    #[must_use]
    pub fn from_f64(symbol: impl Into<Symbol>, price: f64, timestamp_ms: i64) -> Option<Self> {
        decimal_from_f64(price).map(|price| Self::new(symbol, price, timestamp_ms))
    }

    /// Set the absolute change.
    #[must_use]
    pub const fn with_change(mut self, change: Decimal) -> Self {
        self.change = Some(change);
        self
    }

    /// Set the percent change.
    #[must_use]
    pub const fn with_change_percent(mut self, change_percent: Decimal) -> Self {
        self.change_percent = Some(change_percent);
        self
    }

    /// Set the session high and low.
    #[must_use]
    pub const fn with_range(mut self, day_high: Decimal, day_low: Decimal) -> Self {
        self.day_high = Some(day_high);
        self.day_low = Some(day_low);
        self
    }

    /// Set the volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Set the market session.
    #[must_use]
    pub const fn with_session(mut self, session: MarketSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Merge a newer update for the same symbol into this quote.
    ///
    /// Price and timestamp always take the update's values. Optional fields
    /// are only overwritten when the update carries them, so a price-only
    /// trade tick does not erase ticker detail received earlier.
    pub fn merge(&mut self, update: &Self) {
        self.price = update.price;
        self.timestamp_ms = update.timestamp_ms;
        merge_field(&mut self.change, update.change);
        merge_field(&mut self.change_percent, update.change_percent);
        merge_field(&mut self.day_high, update.day_high);
        merge_field(&mut self.day_low, update.day_low);
        merge_field(&mut self.volume, update.volume);
        merge_field(&mut self.session, update.session);
    }
}

fn merge_field<T: Copy>(current: &mut Option<T>, update: Option<T>) {
    if update.is_some() {
        *current = update;
    }
}

/// Convert a float into a `Decimal`, rejecting non-finite values.
#[must_use]
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if value.is_finite() {
        Decimal::from_f64(value)
    } else {
        None
    }
}

/// Convert a single-precision float into a `Decimal`, rejecting non-finite values.
#[must_use]
pub fn decimal_from_f32(value: f32) -> Option<Decimal> {
    if value.is_finite() {
        Decimal::from_f32(value)
    } else {
        None
    }
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_detail_missing_from_update() {
        let mut ticker = Quote::new("AAPL", Decimal::new(18725, 2), 1_000)
            .with_change(Decimal::new(150, 2))
            .with_range(Decimal::new(19000, 2), Decimal::new(18500, 2));

        let trade = Quote::new("AAPL", Decimal::new(18730, 2), 2_000);
        ticker.merge(&trade);

        assert_eq!(ticker.price, Decimal::new(18730, 2));
        assert_eq!(ticker.timestamp_ms, 2_000);
        assert_eq!(ticker.change, Some(Decimal::new(150, 2)));
        assert_eq!(ticker.day_high, Some(Decimal::new(19000, 2)));
    }

    #[test]
    fn merge_overwrites_fields_present_in_update() {
        let mut quote = Quote::new("MSFT", Decimal::ONE, 1).with_volume(Decimal::TEN);
        let update = Quote::new("MSFT", Decimal::TWO, 2)
            .with_volume(Decimal::ONE_HUNDRED)
            .with_session(MarketSession::Post);

        quote.merge(&update);

        assert_eq!(quote.volume, Some(Decimal::ONE_HUNDRED));
        assert_eq!(quote.session, Some(MarketSession::Post));
    }

    #[test]
    fn non_finite_prices_are_rejected() {
        assert!(Quote::from_f64("X", f64::NAN, 0).is_none());
        assert!(Quote::from_f64("X", f64::INFINITY, 0).is_none());
        assert!(decimal_from_f32(f32::NEG_INFINITY).is_none());
        assert_eq!(
            Quote::from_f64("X", 187.25, 0).map(|q| q.price),
            Some(Decimal::new(18725, 2))
        );
    }

    #[test]
    fn session_labels_and_codes() {
        assert_eq!(MarketSession::from_label("PRE_MARKET"), Some(MarketSession::Pre));
        assert_eq!(MarketSession::from_label("regular"), Some(MarketSession::Regular));
        assert_eq!(MarketSession::from_label("lunch"), None);
        assert_eq!(MarketSession::from_code(2), Some(MarketSession::Post));
        assert_eq!(MarketSession::from_code(9), None);
    }

    #[test]
    fn optional_fields_are_omitted_when_serialized() {
        let quote = Quote::new("AAPL", Decimal::ONE, 5);
        let json = serde_json::to_string(&quote).unwrap();
        assert!(!json.contains("change"));
        assert!(json.contains(r#""timestamp_ms":5"#));
    }
}
