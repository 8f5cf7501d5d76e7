//! Domain Layer - Core quote streaming types and business logic.
//!
//! This layer contains the canonical quote model, the connection
//! lifecycle and the subscription registry. Nothing here touches the
//! network or the runtime.

/// Canonical quote model shared by every provider.
pub mod quote;

/// Provider identity, connection states, events and errors.
pub mod streaming;

/// Subscription registry and fan-out.
pub mod subscription;
