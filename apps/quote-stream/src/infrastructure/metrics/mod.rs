//! Prometheus Metrics Module
//!
//! Exposes streaming metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames, decoded quotes, upstream control frames
//! - **Errors**: Decode failures, provider errors, callback panics
//! - **Connections**: Connection state and reconnect attempts per provider
//! - **Subscriptions**: Active symbols per provider
//! - **Latency**: Fan-out duration
//!
//! Recording functions are no-ops until a recorder is installed, so the
//! library can be used without the exporter.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::domain::streaming::{ConnectionState, ProviderId};

/// Start the Prometheus exporter listening on `addr`.
///
/// # Errors
///
/// Returns an error if the exporter fails to start (e.g., port already in use).
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "quote_stream_frames_received_total",
        "Total frames received from upstream providers"
    );
    describe_counter!(
        "quote_stream_quotes_decoded_total",
        "Total quotes decoded from inbound frames"
    );
    describe_counter!(
        "quote_stream_control_frames_sent_total",
        "Total subscribe/unsubscribe frames sent upstream"
    );
    describe_counter!(
        "quote_stream_decode_errors_total",
        "Total inbound frames that failed to decode"
    );
    describe_counter!(
        "quote_stream_provider_errors_total",
        "Total error messages reported by providers"
    );
    describe_counter!(
        "quote_stream_callback_panics_total",
        "Total consumer callbacks that panicked during fan-out"
    );
    describe_counter!(
        "quote_stream_reconnects_total",
        "Total reconnection attempts"
    );
    describe_gauge!(
        "quote_stream_connection_state",
        "Connection state (0 disconnected, 1 connecting, 2 connected, 3 reconnecting)"
    );
    describe_gauge!(
        "quote_stream_active_symbols",
        "Symbols with at least one subscriber"
    );
    describe_histogram!(
        "quote_stream_fanout_seconds",
        "Time to deliver one decoded frame to subscribers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound frame.
pub fn record_frame_received(provider: ProviderId, kind: &'static str) {
    counter!(
        "quote_stream_frames_received_total",
        "provider" => provider.as_str(),
        "kind" => kind
    )
    .increment(1);
}

/// Record decoded quotes.
pub fn record_quotes_decoded(provider: ProviderId, count: usize) {
    counter!(
        "quote_stream_quotes_decoded_total",
        "provider" => provider.as_str()
    )
    .increment(count as u64);
}

/// Record upstream control frames.
pub fn record_control_frames(provider: ProviderId, action: &'static str, count: usize) {
    counter!(
        "quote_stream_control_frames_sent_total",
        "provider" => provider.as_str(),
        "action" => action
    )
    .increment(count as u64);
}

/// Record a frame that failed to decode.
pub fn record_decode_error(provider: ProviderId, error_type: &'static str) {
    counter!(
        "quote_stream_decode_errors_total",
        "provider" => provider.as_str(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Record a provider-reported error.
pub fn record_provider_error(provider: ProviderId) {
    counter!(
        "quote_stream_provider_errors_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Record panicking consumer callbacks.
pub fn record_callback_panics(provider: ProviderId, count: usize) {
    counter!(
        "quote_stream_callback_panics_total",
        "provider" => provider.as_str()
    )
    .increment(count as u64);
}

/// Record a reconnection attempt.
pub fn record_reconnect(provider: ProviderId) {
    counter!(
        "quote_stream_reconnects_total",
        "provider" => provider.as_str()
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(provider: ProviderId, state: ConnectionState) {
    gauge!(
        "quote_stream_connection_state",
        "provider" => provider.as_str()
    )
    .set(state.gauge_value());
}

/// Update the active symbol gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_symbols(provider: ProviderId, count: usize) {
    gauge!(
        "quote_stream_active_symbols",
        "provider" => provider.as_str()
    )
    .set(count as f64);
}

/// Record fan-out duration for one frame.
pub fn record_fanout_duration(provider: ProviderId, duration: Duration) {
    histogram!(
        "quote_stream_fanout_seconds",
        "provider" => provider.as_str()
    )
    .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_frame_received(ProviderId::BinaryFrame, "binary");
        record_quotes_decoded(ProviderId::BinaryFrame, 3);
        set_connection_state(ProviderId::BinaryFrame, ConnectionState::Connected);
        record_fanout_duration(ProviderId::BinaryFrame, Duration::from_micros(5));
    }

    #[test]
    fn gauge_values_are_distinct() {
        let values = [
            ConnectionState::Disconnected.gauge_value(),
            ConnectionState::Connecting.gauge_value(),
            ConnectionState::Connected.gauge_value(),
            ConnectionState::Reconnecting.gauge_value(),
        ];
        for (i, a) in values.iter().enumerate() {
            for b in &values[i + 1..] {
                assert!((a - b).abs() > f64::EPSILON);
            }
        }
    }
}
