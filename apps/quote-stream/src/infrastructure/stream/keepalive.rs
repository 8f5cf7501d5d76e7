//! Keepalive Monitor
//!
//! Asks the socket loop to send the provider's keepalive frame on a fixed
//! interval and reports a stalled link when nothing has arrived for longer
//! than the timeout since a keepalive went out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::ProviderSettings;

/// Configuration for keepalive behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between keepalive frames. Zero disables keepalive.
    pub interval: Duration,
    /// Silence tolerated after a keepalive before the link counts as dead.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

impl KeepaliveConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Create configuration from provider settings.
    #[must_use]
    pub const fn from_provider_settings(settings: &ProviderSettings) -> Self {
        Self {
            interval: settings.keepalive_interval,
            timeout: settings.keepalive_timeout,
        }
    }

    /// Check if keepalive is turned on.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Events emitted by the keepalive monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send a keepalive frame now.
    Due,
    /// The link has been silent past the timeout.
    Stalled,
}

/// Link activity shared between the monitor and the socket loop.
#[derive(Debug)]
pub struct KeepaliveState {
    last_activity: RwLock<Instant>,
    awaiting_reply: AtomicBool,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepaliveState {
    /// Create new keepalive state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            awaiting_reply: AtomicBool::new(false),
        }
    }

    /// Record that a frame arrived.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.awaiting_reply.store(false, Ordering::SeqCst);
    }

    /// Mark that a keepalive frame was sent.
    pub fn mark_sent(&self) {
        self.awaiting_reply.store(true, Ordering::SeqCst);
    }

    /// Check if a keepalive is outstanding.
    #[must_use]
    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

/// Ticks keepalive events for one connected session.
pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    event_tx: mpsc::Sender<KeepaliveEvent>,
    cancel: CancellationToken,
}

impl KeepaliveMonitor {
    /// Create a new keepalive monitor.
    #[must_use]
    pub const fn new(
        config: KeepaliveConfig,
        state: Arc<KeepaliveState>,
        event_tx: mpsc::Sender<KeepaliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or the link stalls.
    pub async fn run(self) {
        if !self.config.is_enabled() {
            return;
        }

        let period = self.config.interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Keepalive monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.tick().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Check for a stall, otherwise request a keepalive.
    ///
    /// Returns `Err(())` when the loop should exit.
    async fn tick(&self) -> Result<(), ()> {
        if self.state.is_awaiting_reply() {
            let idle = self.state.idle_for();
            if idle > self.config.timeout {
                tracing::warn!(
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Keepalive timeout detected"
                );
                let _ = self.event_tx.send(KeepaliveEvent::Stalled).await;
                return Err(());
            }
        }

        if self.event_tx.send(KeepaliveEvent::Due).await.is_err() {
            tracing::debug!("Keepalive channel closed");
            return Err(());
        }

        Ok(())
    }
}
