//! Streaming Connection
//!
//! One physical link to an upstream provider, shared by every consumer of
//! that provider.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──handshake──► Connected
//!      ▲                        │    ▲                      │
//!      │ exhausted/disconnect() │    │ backoff elapsed      │ unexpected close
//!      └────────────────────────┴── Reconnecting ◄──────────┘
//! ```
//!
//! A socket task per session runs the read loop, answers pings, drives
//! keepalive and sleeps out backoff delays. The subscription registry,
//! state and reconnect policy live behind one lock shared with callers on
//! other tasks. Callbacks always run outside that lock.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveMonitor, KeepaliveState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{Frame, FrameSink, Link, Transport, TransportError};
use crate::domain::quote::{Quote, Symbol};
use crate::domain::streaming::{
    ConnectionEvent, ConnectionState, ConnectionStateMachine, ProviderId, StreamError,
};
use crate::domain::subscription::{
    CallbackId, FanoutReport, QuoteCallback, SubscriptionHandle, SubscriptionKey,
    SubscriptionRegistry, SubscriptionStats, deliver,
};
use crate::infrastructure::config::ProviderSettings;
use crate::infrastructure::metrics;
use crate::infrastructure::providers::{ProviderCodec, codec_for};

/// Capacity of the connection event channel.
const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Shared State
// =============================================================================

/// State guarded by the connection lock.
struct Shared {
    state: ConnectionState,
    registry: SubscriptionRegistry,
    /// Control frame queue drained by the socket task; set only while connected.
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    /// Cancels the current socket task and its backoff timer.
    cancel: Option<CancellationToken>,
    reconnect: ReconnectPolicy,
    /// Bumped on every connect and disconnect so stale tasks can tell.
    session: u64,
    last_error: Option<StreamError>,
}

/// How a socket session ended.
enum SessionEnd {
    Cancelled,
    Failed(TransportError),
}

#[derive(Clone, Copy)]
enum Control {
    Subscribe,
    Unsubscribe,
}

impl Control {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

struct ConnectionInner {
    provider: ProviderId,
    settings: ProviderSettings,
    codec: Arc<dyn ProviderCodec>,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

// =============================================================================
// Streaming Connection
// =============================================================================

/// Shared streaming connection to one provider.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct StreamingConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for StreamingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingConnection")
            .field("provider", &self.inner.provider)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamingConnection {
    /// Create a disconnected connection using the provider's codec.
    #[must_use]
    pub fn new(
        provider: ProviderId,
        settings: ProviderSettings,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_codec(codec_for(provider), settings, transport)
    }

    /// Create a disconnected connection with an explicit codec.
    #[must_use]
    pub fn with_codec(
        codec: Arc<dyn ProviderCodec>,
        settings: ProviderSettings,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let reconnect = ReconnectPolicy::new(ReconnectConfig::from_provider_settings(&settings));

        Self {
            inner: Arc::new(ConnectionInner {
                provider: codec.provider(),
                settings,
                codec,
                transport,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    registry: SubscriptionRegistry::new(),
                    outbound: None,
                    cancel: None,
                    reconnect,
                    session: 0,
                    last_error: None,
                }),
                state_tx,
                events_tx,
            }),
        }
    }

    /// Provider this connection talks to.
    #[must_use]
    pub fn provider(&self) -> ProviderId {
        self.inner.provider
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Watch state changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to status, reconnect and error events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Symbols with at least one subscriber.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.inner.shared.lock().registry.active_symbols()
    }

    /// Subscription registry statistics.
    #[must_use]
    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.inner.shared.lock().registry.stats()
    }

    /// Bring the connection up.
    ///
    /// When disconnected, a new session starts before this returns: the
    /// state moves to `Connecting` and the socket task is spawned, so it
    /// must be called from within a Tokio runtime. When a session is
    /// already running the returned future joins it.
    ///
    /// The future resolves `Ok` once connected, or with the error that
    /// ended the session.
    pub fn connect(&self) -> impl Future<Output = Result<(), StreamError>> + Send + 'static {
        let mut status = self.inner.state_tx.subscribe();

        {
            let mut shared = self.inner.shared.lock();
            if shared.state == ConnectionState::Disconnected {
                shared.session += 1;
                shared.reconnect.reset();
                shared.last_error = None;

                let cancel = CancellationToken::new();
                shared.cancel = Some(cancel.clone());
                self.inner.transition(&mut shared, ConnectionState::Connecting);

                let session = shared.session;
                tokio::spawn(Arc::clone(&self.inner).run(session, cancel));
            }
        }

        let inner = Arc::clone(&self.inner);
        async move {
            let settled = match status
                .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
                .await
            {
                Ok(state) => *state,
                Err(_) => return Err(StreamError::Disconnected),
            };

            if settled == ConnectionState::Connected {
                Ok(())
            } else {
                Err(inner
                    .shared
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or(StreamError::Disconnected))
            }
        }
    }

    /// Register a callback for a key.
    ///
    /// On first interest in a symbol the upstream subscribe is sent if the
    /// connection is up; otherwise it goes out on the next connect. The
    /// wildcard is never sent upstream.
    pub fn subscribe(&self, key: SubscriptionKey, callback: QuoteCallback) -> SubscriptionHandle {
        let id = callback.id();
        self.inner.subscribe(key.clone(), callback);

        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        let release_key = key.clone();
        SubscriptionHandle::new(key, id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(&release_key, Some(id));
            }
        })
    }

    /// Register a closure for a key.
    pub fn subscribe_fn(
        &self,
        key: SubscriptionKey,
        f: impl Fn(&Quote) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.subscribe(key, QuoteCallback::new(f))
    }

    /// Remove one callback, or every callback for the key.
    pub fn unsubscribe(&self, key: &SubscriptionKey, id: Option<CallbackId>) {
        self.inner.unsubscribe(key, id);
    }

    /// Close the link and cancel any pending reconnect.
    ///
    /// Subscriptions are kept and replayed on the next connect.
    pub fn disconnect(&self) {
        let mut shared = self.inner.shared.lock();
        shared.session += 1;
        if let Some(cancel) = shared.cancel.take() {
            cancel.cancel();
        }
        if shared.state != ConnectionState::Disconnected {
            shared.last_error = Some(StreamError::Disconnected);
            self.inner.transition(&mut shared, ConnectionState::Disconnected);
            tracing::info!(provider = %self.inner.provider, "Disconnected");
        }
    }

    /// Remove every subscription, unsubscribing upstream if connected.
    pub fn clear_subscriptions(&self) {
        let mut shared = self.inner.shared.lock();
        let symbols = shared.registry.clear();
        self.inner.send_control(&shared, Control::Unsubscribe, &symbols);
        metrics::set_active_symbols(self.inner.provider, 0);
    }
}

// =============================================================================
// Connection Internals
// =============================================================================

impl ConnectionInner {
    /// Apply a validated state transition and notify observers.
    fn transition(&self, shared: &mut Shared, to: ConnectionState) -> bool {
        let from = shared.state;
        if let Err(e) = ConnectionStateMachine::validate_transition(from, to) {
            tracing::warn!(provider = %self.provider, error = %e, "Rejected state transition");
            return false;
        }

        shared.state = to;
        if from == ConnectionState::Connected {
            shared.outbound = None;
        }

        self.state_tx.send_replace(to);
        self.publish(ConnectionEvent::StatusChanged {
            provider: self.provider,
            state: to,
        });
        metrics::set_connection_state(self.provider, to);
        tracing::debug!(provider = %self.provider, from = %from, to = %to, "Connection state changed");
        true
    }

    fn publish(&self, event: ConnectionEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn subscribe(&self, key: SubscriptionKey, callback: QuoteCallback) {
        let mut shared = self.shared.lock();
        let symbol = key.as_symbol().map(ToString::to_string);
        if shared.registry.subscribe(key, callback)
            && let Some(symbol) = symbol
        {
            self.send_control(&shared, Control::Subscribe, &[symbol]);
            metrics::set_active_symbols(self.provider, shared.registry.stats().symbol_count);
        }
    }

    fn unsubscribe(&self, key: &SubscriptionKey, id: Option<CallbackId>) {
        let mut shared = self.shared.lock();
        if shared.registry.unsubscribe(key, id)
            && let Some(symbol) = key.as_symbol()
        {
            self.send_control(&shared, Control::Unsubscribe, &[symbol.to_string()]);
            metrics::set_active_symbols(self.provider, shared.registry.stats().symbol_count);
        }
    }

    /// Queue control frames if connected. Otherwise the registry replays
    /// them on the next connect.
    fn send_control(&self, shared: &Shared, action: Control, symbols: &[Symbol]) {
        if symbols.is_empty() || shared.state != ConnectionState::Connected {
            return;
        }
        let Some(outbound) = &shared.outbound else {
            return;
        };

        let frames = match action {
            Control::Subscribe => self.codec.encode_subscribe(symbols),
            Control::Unsubscribe => self.codec.encode_unsubscribe(symbols),
        };
        tracing::debug!(
            provider = %self.provider,
            action = action.as_str(),
            symbols = ?symbols,
            "Sending control frames"
        );
        metrics::record_control_frames(self.provider, action.as_str(), frames.len());
        for frame in frames {
            if outbound.send(frame).is_err() {
                tracing::debug!(provider = %self.provider, "Outbound queue closed");
                break;
            }
        }
    }

    /// Socket task: connect, stream, and back off until cancelled or exhausted.
    async fn run(self: Arc<Self>, session: u64, cancel: CancellationToken) {
        loop {
            let err = match self.connect_and_run(session, &cancel).await {
                SessionEnd::Cancelled => return,
                SessionEnd::Failed(err) => err,
            };

            let delay = {
                let mut shared = self.shared.lock();
                if shared.session != session {
                    return;
                }

                tracing::warn!(provider = %self.provider, error = %err, "Streaming connection lost");
                shared.last_error = Some(StreamError::Transport(err.to_string()));

                if let Some(delay) = shared.reconnect.next_delay() {
                    let attempt = shared.reconnect.attempt_count();
                    self.transition(&mut shared, ConnectionState::Reconnecting);
                    self.publish(ConnectionEvent::Reconnecting {
                        provider: self.provider,
                        attempt,
                        delay,
                    });
                    metrics::record_reconnect(self.provider);
                    tracing::info!(
                        provider = %self.provider,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting"
                    );
                    delay
                } else {
                    let error = StreamError::ReconnectExhausted {
                        attempts: shared.reconnect.attempt_count(),
                    };
                    tracing::error!(provider = %self.provider, error = %error, "Giving up on connection");
                    shared.last_error = Some(error.clone());
                    shared.cancel = None;
                    self.publish(ConnectionEvent::Error {
                        provider: self.provider,
                        error,
                    });
                    self.transition(&mut shared, ConnectionState::Disconnected);
                    return;
                }
            };

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            let mut shared = self.shared.lock();
            if shared.session != session {
                return;
            }
            self.transition(&mut shared, ConnectionState::Connecting);
        }
    }

    /// Open one link and stream until it fails or the session is cancelled.
    async fn connect_and_run(&self, session: u64, cancel: &CancellationToken) -> SessionEnd {
        let url_symbols = if self.codec.embeds_subscriptions_in_url() {
            self.shared.lock().registry.active_symbols()
        } else {
            Vec::new()
        };
        let url = self.codec.endpoint(&self.settings.base_url(), &url_symbols);

        tracing::info!(provider = %self.provider, url = %self.settings.url, "Connecting");

        let opened = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            result = self.transport.open(&url) => result,
        };
        let Link {
            mut sink,
            mut stream,
        } = match opened {
            Ok(link) => link,
            Err(e) => return SessionEnd::Failed(e),
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.shared.lock();
            if shared.session != session || cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            if !self.transition(&mut shared, ConnectionState::Connected) {
                return SessionEnd::Cancelled;
            }
            shared.reconnect.reset();
            shared.last_error = None;
            shared.outbound = Some(outbound_tx);

            // Replay the registry against what the URL already subscribed
            let active = shared.registry.active_symbols();
            let missing: Vec<Symbol> = active
                .iter()
                .filter(|s| !url_symbols.contains(s))
                .cloned()
                .collect();
            let stale: Vec<Symbol> = url_symbols
                .iter()
                .filter(|s| !active.contains(s))
                .cloned()
                .collect();
            self.send_control(&shared, Control::Subscribe, &missing);
            self.send_control(&shared, Control::Unsubscribe, &stale);
        }
        tracing::info!(provider = %self.provider, "Connected");

        let keepalive_state = Arc::new(KeepaliveState::new());
        let (keepalive_tx, mut keepalive_rx) = mpsc::channel(4);
        let keepalive_cancel = cancel.child_token();
        tokio::spawn(
            KeepaliveMonitor::new(
                KeepaliveConfig::from_provider_settings(&self.settings),
                Arc::clone(&keepalive_state),
                keepalive_tx,
                keepalive_cancel.clone(),
            )
            .run(),
        );
        let _keepalive_guard = keepalive_cancel.drop_guard();

        let end = loop {
            tokio::select! {
                () = cancel.cancelled() => break SessionEnd::Cancelled,
                Some(event) = keepalive_rx.recv() => match event {
                    KeepaliveEvent::Due => {
                        keepalive_state.mark_sent();
                        if let Err(e) = sink.send(self.codec.keepalive()).await {
                            break SessionEnd::Failed(e);
                        }
                    }
                    KeepaliveEvent::Stalled => {
                        break SessionEnd::Failed(TransportError::Socket("keepalive timeout".to_string()));
                    }
                },
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        break SessionEnd::Failed(e);
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => {
                        keepalive_state.record_activity();
                        if let Err(e) = self.handle_frame(session, frame, &mut sink).await {
                            break SessionEnd::Failed(e);
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => break SessionEnd::Failed(TransportError::Closed),
                },
            }
        };

        let _ = sink.close().await;
        end
    }

    /// Process one inbound frame: reply first, then errors, then fan-out.
    async fn handle_frame(
        &self,
        session: u64,
        frame: Frame,
        sink: &mut FrameSink,
    ) -> Result<(), TransportError> {
        metrics::record_frame_received(self.provider, frame.kind());

        match frame {
            Frame::Ping(payload) => return sink.send(Frame::Pong(payload)).await,
            Frame::Pong(_) => return Ok(()),
            Frame::Text(_) | Frame::Binary(_) => {}
        }

        let inbound = match self.codec.decode(&frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(
                    provider = %self.provider,
                    frame = frame.kind(),
                    error = %e,
                    "Failed to decode frame"
                );
                metrics::record_decode_error(self.provider, e.kind());
                self.publish(ConnectionEvent::Error {
                    provider: self.provider,
                    error: StreamError::Decode(e.to_string()),
                });
                return Ok(());
            }
        };

        if let Some(reply) = inbound.reply {
            sink.send(reply).await?;
        }

        if let Some(message) = inbound.error {
            tracing::warn!(provider = %self.provider, message = %message, "Provider reported an error");
            metrics::record_provider_error(self.provider);
            self.publish(ConnectionEvent::Error {
                provider: self.provider,
                error: StreamError::Protocol(message),
            });
        }

        if inbound.quotes.is_empty() {
            return Ok(());
        }

        metrics::record_quotes_decoded(self.provider, inbound.quotes.len());
        let started = Instant::now();
        let mut report = FanoutReport::default();
        for quote in &inbound.quotes {
            let targets = {
                let shared = self.shared.lock();
                if shared.session != session {
                    return Ok(());
                }
                shared.registry.targets(&quote.symbol)
            };
            let delivered = deliver(&targets, quote);
            report.delivered += delivered.delivered;
            report.failed += delivered.failed;
        }

        if report.failed > 0 {
            metrics::record_callback_panics(self.provider, report.failed);
        }
        metrics::record_fanout_duration(self.provider, started.elapsed());
        Ok(())
    }
}
