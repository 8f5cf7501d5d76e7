#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Quote Stream - Real-Time Market Data Streaming Layer
//!
//! Maintains one WebSocket connection per upstream quote provider and
//! multiplexes decoded quotes to many independent consumers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `quote`: Canonical quote record
//!   - `streaming`: Providers, connection states, events and errors
//!   - `subscription`: Reference-counted subscription registry and fan-out
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and quote feed interfaces
//!   - `services`: Quote consumer adapter
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `providers`: Wire codecs for the JSON-control, combined-stream and
//!     binary-frame feeds
//!   - `stream`: Shared connections, reconnect policy, keepalive and the
//!     process-wide connection registry
//!   - `transport`: WebSocket transport
//!   - `config`, `metrics`, `telemetry`: Environment, Prometheus, tracing
//!
//! # Data Flow
//!
//! ```text
//! QuoteConsumer ──subscribe──► StreamingConnection ──control frame──► provider
//!       ▲                              │
//!       └──── merged QuoteMap ◄─ fan-out ◄─ ProviderCodec::decode ◄── frame
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::quote::{MarketSession, Quote, QuoteMap, Symbol};
pub use domain::streaming::{ConnectionEvent, ConnectionState, ProviderId, StreamError};
pub use domain::subscription::{
    CallbackId, QuoteCallback, SubscriptionHandle, SubscriptionKey, SubscriptionRegistry,
};

// Application
pub use application::ports::{Frame, QuoteFeed, Transport, TransportError};
pub use application::services::{QuoteConsumer, SymbolDiff};

// Infrastructure
pub use infrastructure::config::{ProviderSettings, StreamSettings};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::stream::{ConnectionRegistry, StreamingConnection};
