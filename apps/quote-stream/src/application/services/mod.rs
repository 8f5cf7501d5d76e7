//! Application Services
//!
//! Services that sit between quote consumers and the feed port.
//!
//! - `QuoteConsumer`: Keeps a consumer's symbol set attached to a provider
//!   and merges delivered quotes into a keyed map

mod consumer;

pub use consumer::{QuoteConsumer, SymbolDiff};
