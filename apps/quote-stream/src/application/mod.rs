//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the consumer-facing services and the port
//! interfaces that the infrastructure adapters implement.

/// Port interfaces for the transport and the quote feed.
pub mod ports;

/// Application services for quote consumers.
pub mod services;
