//! Connection Registry
//!
//! Process-wide table of streaming connections, at most one per provider.
//! Connections are created lazily on first use and torn down together at
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::connection::StreamingConnection;
use crate::application::ports::{QuoteFeed, Transport};
use crate::domain::streaming::{ConnectionState, ProviderId, StreamError};
use crate::domain::subscription::{QuoteCallback, SubscriptionHandle, SubscriptionKey};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::transport::WebSocketTransport;

/// Owns the shared connection for each provider.
pub struct ConnectionRegistry {
    settings: StreamSettings,
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<ProviderId, StreamingConnection>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.lock().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(settings: StreamSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
            connections: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Create an empty registry that opens real WebSocket links.
    #[must_use]
    pub fn with_websocket_transport(settings: StreamSettings) -> Self {
        Self::new(settings, Arc::new(WebSocketTransport::new()))
    }

    /// The connection for `provider`, created on first use.
    ///
    /// Creating a connection does not open it.
    pub fn connection(&self, provider: ProviderId) -> StreamingConnection {
        self.connections
            .lock()
            .entry(provider)
            .or_insert_with(|| {
                tracing::debug!(provider = %provider, "Creating streaming connection");
                StreamingConnection::new(
                    provider,
                    self.settings.provider(provider).clone(),
                    Arc::clone(&self.transport),
                )
            })
            .clone()
    }

    /// The connection for `provider`, if one exists.
    #[must_use]
    pub fn get(&self, provider: ProviderId) -> Option<StreamingConnection> {
        self.connections.lock().get(&provider).cloned()
    }

    /// Disconnect every connection, drop its subscriptions and forget it.
    ///
    /// A later [`connection`](Self::connection) call starts fresh.
    pub fn disconnect_all(&self) {
        let drained: Vec<StreamingConnection> = {
            let mut connections = self.connections.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            connections.drain().map(|(_, connection)| connection).collect()
        };

        for connection in drained {
            connection.disconnect();
            connection.clear_subscriptions();
        }
        tracing::info!("All streaming connections closed");
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Check if no connection exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

impl QuoteFeed for ConnectionRegistry {
    fn connect(&self, provider: ProviderId) -> BoxFuture<'static, Result<(), StreamError>> {
        Box::pin(self.connection(provider).connect())
    }

    fn subscribe(
        &self,
        provider: ProviderId,
        key: SubscriptionKey,
        callback: QuoteCallback,
    ) -> SubscriptionHandle {
        self.connection(provider).subscribe(key, callback)
    }

    fn status(&self, provider: ProviderId) -> watch::Receiver<ConnectionState> {
        self.connection(provider).status()
    }
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockTransport;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(StreamSettings::default(), Arc::new(MockTransport::new()))
    }

    #[test]
    fn connections_are_created_lazily_once_per_provider() {
        let registry = registry();
        assert!(registry.is_empty());
        assert!(registry.get(ProviderId::BinaryFrame).is_none());

        let first = registry.connection(ProviderId::BinaryFrame);
        let second = registry.connection(ProviderId::BinaryFrame);
        registry.connection(ProviderId::JsonControl);

        assert_eq!(registry.len(), 2);
        assert_eq!(first.provider(), ProviderId::BinaryFrame);
        assert_eq!(second.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn subscriptions_share_one_connection() {
        let registry = registry();
        let _a = registry.subscribe(
            ProviderId::JsonControl,
            SubscriptionKey::symbol("AAPL"),
            QuoteCallback::new(|_| {}),
        );
        let _b = registry.subscribe(
            ProviderId::JsonControl,
            SubscriptionKey::symbol("AAPL"),
            QuoteCallback::new(|_| {}),
        );

        let connection = registry.connection(ProviderId::JsonControl);
        assert_eq!(connection.subscription_stats().callback_count, 2);
        assert_eq!(connection.active_symbols(), vec!["AAPL".to_string()]);
    }

    #[test]
    fn disconnect_all_forgets_connections_and_subscriptions() {
        let registry = registry();
        let _handle = registry.subscribe(
            ProviderId::CombinedStream,
            SubscriptionKey::symbol("btcusdt"),
            QuoteCallback::new(|_| {}),
        );
        let old = registry.connection(ProviderId::CombinedStream);

        let before = registry.generation();
        registry.disconnect_all();

        assert_eq!(registry.generation(), before + 1);
        assert!(registry.is_empty());
        assert!(old.active_symbols().is_empty());
        assert!(
            registry
                .connection(ProviderId::CombinedStream)
                .active_symbols()
                .is_empty()
        );
    }
}
