//! Streaming Module
//!
//! Shared provider connections and the policies that keep them alive.
//!
//! # Architecture
//!
//! ```text
//! QuoteConsumer ──► ConnectionRegistry ──► StreamingConnection (one per provider)
//!                                             │
//!                                             ├── ProviderCodec (wire format)
//!                                             ├── SubscriptionRegistry (fan-out)
//!                                             ├── ReconnectPolicy (backoff)
//!                                             └── KeepaliveMonitor (liveness)
//! ```

mod connection;
mod keepalive;
mod reconnect;
mod registry;

pub use connection::StreamingConnection;
pub use keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveMonitor, KeepaliveState};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use registry::ConnectionRegistry;
