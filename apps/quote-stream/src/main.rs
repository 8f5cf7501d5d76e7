//! Quote Stream Binary
//!
//! Connects to the configured provider, logs every quote for the
//! configured symbols and shuts down cleanly on a signal.
//!
//! # Usage
//!
//! ```bash
//! QUOTE_STREAM_SYMBOLS=AAPL,MSFT cargo run --bin quote-stream
//! ```
//!
//! # Environment Variables
//!
//! - `QUOTE_STREAM_PROVIDER`: json_control | combined_stream | binary_frame (default: json_control)
//! - `QUOTE_STREAM_SYMBOLS`: Comma-separated symbols to attach
//! - `QUOTE_STREAM_METRICS_PORT`: Prometheus port, 0 disables (default: 9090)
//! - `QUOTE_STREAM_{JSON_CONTROL,COMBINED,BINARY}_URL`, `_TOKEN`, `_MAX_RECONNECT_ATTEMPTS`,
//!   `_RECONNECT_BASE_DELAY_MS`, `_RECONNECT_MAX_DELAY_MS`,
//!   `_KEEPALIVE_INTERVAL_SECS`, `_KEEPALIVE_TIMEOUT_SECS`: Per-provider overrides
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: Tracing export
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use quote_stream::infrastructure::telemetry;
use quote_stream::{
    ConnectionEvent, ConnectionRegistry, QuoteConsumer, QuoteFeed, StreamSettings,
    SubscriptionKey, init_metrics,
};
use tokio::signal;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Quote Stream");

    let settings = StreamSettings::from_env()?;
    log_settings(&settings);

    if settings.metrics_port != 0 {
        init_metrics(SocketAddr::from(([0, 0, 0, 0], settings.metrics_port)))?;
    }

    let provider = settings.provider;
    let symbols = settings.symbols.clone();
    let registry = Arc::new(ConnectionRegistry::with_websocket_transport(settings));

    let connection = registry.connection(provider);
    tokio::spawn(log_events(connection.events()));

    let _tape = connection.subscribe_fn(SubscriptionKey::Wildcard, |quote| {
        tracing::info!(
            symbol = %quote.symbol,
            price = %quote.price,
            timestamp_ms = quote.timestamp_ms,
            "Quote"
        );
    });

    let mut consumer = QuoteConsumer::new(Arc::clone(&registry) as Arc<dyn QuoteFeed>, provider);
    let diff = consumer.attach(symbols);
    tracing::info!(provider = %provider, symbols = ?diff.added, "Consumer attached");

    await_shutdown().await;

    consumer.detach();
    registry.disconnect_all();

    tracing::info!("Quote Stream stopped");
    Ok(())
}

/// Log connection events until the connection goes away.
async fn log_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StatusChanged { provider, state }) => {
                tracing::info!(provider = %provider, state = %state, "Connection status");
            }
            Ok(ConnectionEvent::Reconnecting {
                provider,
                attempt,
                delay,
            }) => {
                tracing::info!(
                    provider = %provider,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnect scheduled"
                );
            }
            Ok(ConnectionEvent::Error { provider, error }) => {
                tracing::error!(provider = %provider, error = %error, "Stream error");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Log the parsed configuration.
fn log_settings(settings: &StreamSettings) {
    let active = settings.provider(settings.provider);
    tracing::info!(
        provider = %settings.provider,
        url = %active.url,
        max_reconnect_attempts = active.max_reconnect_attempts,
        symbols = settings.symbols.len(),
        metrics_port = settings.metrics_port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
