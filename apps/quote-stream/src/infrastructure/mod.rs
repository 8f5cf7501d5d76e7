//! Infrastructure Layer - External integrations.
//!
//! This layer contains the adapters that talk to the outside world:
//! WebSocket transport, provider codecs, connection management,
//! configuration, metrics and telemetry.

/// Environment-driven configuration.
pub mod config;

/// Prometheus metrics.
pub mod metrics;

/// Provider wire codecs.
pub mod providers;

/// Shared streaming connections.
pub mod stream;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;

/// WebSocket transport adapter.
pub mod transport;
