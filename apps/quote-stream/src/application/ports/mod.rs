//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: Opens a bidirectional frame link to an upstream provider
//!
//! ## Driver Ports (Inbound)
//!
//! - `QuoteFeed`: What quote consumers use to connect, subscribe and watch
//!   connection status

use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{Sink, Stream};
use tokio::sync::watch;

use crate::domain::streaming::{ConnectionState, ProviderId, StreamError};
use crate::domain::subscription::{QuoteCallback, SubscriptionHandle, SubscriptionKey};

// =============================================================================
// Transport Port
// =============================================================================

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Transport-level ping.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong(Vec<u8>),
}

impl Frame {
    /// Create a text frame.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Get the text payload, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Frame kind label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
        }
    }
}

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The link could not be opened.
    #[error("failed to open link: {0}")]
    Open(String),

    /// Socket I/O failed.
    #[error("socket error: {0}")]
    Socket(String),

    /// The peer closed the link.
    #[error("link closed")]
    Closed,
}

/// Writing half of a link.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Reading half of a link.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open bidirectional link.
pub struct Link {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames. Ends or yields [`TransportError::Closed`] when the
    /// peer goes away.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens links to upstream providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `url`.
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

// =============================================================================
// Quote Feed Port
// =============================================================================

/// Consumer-facing access to the shared provider connections.
pub trait QuoteFeed: Send + Sync {
    /// Ensure the provider connection is up.
    ///
    /// Resolves once the connection is established, or with the error that
    /// ended the attempt.
    fn connect(&self, provider: ProviderId) -> BoxFuture<'static, Result<(), StreamError>>;

    /// Register a callback for a key on a provider.
    fn subscribe(
        &self,
        provider: ProviderId,
        key: SubscriptionKey,
        callback: QuoteCallback,
    ) -> SubscriptionHandle;

    /// Watch the provider's connection state.
    fn status(&self, provider: ProviderId) -> watch::Receiver<ConnectionState>;

    /// Counter bumped whenever the feed tears its connections down.
    ///
    /// Handles and status receivers obtained under an older generation
    /// belong to a connection that no longer exists.
    fn generation(&self) -> u64;
}
