//! Configuration Module
//!
//! Per-provider connection settings loaded from the environment.

mod settings;

pub use settings::{ApiToken, ConfigError, ProviderSettings, StreamSettings};
