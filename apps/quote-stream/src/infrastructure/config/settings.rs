//! Stream Configuration Settings
//!
//! Configuration types for the quote streaming layer, loaded from
//! environment variables.

use std::time::Duration;

use crate::domain::quote::Symbol;
use crate::domain::streaming::ProviderId;

/// Provider API token.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    /// Create a new token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken([REDACTED])")
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Base WebSocket URL.
    pub url: String,
    /// API token appended as a `token` query parameter.
    pub api_token: Option<ApiToken>,
    /// Maximum reconnection attempts before giving up (0 = never reconnect).
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Ceiling on any single reconnection delay.
    pub reconnect_max_delay: Option<Duration>,
    /// Interval between keepalive frames (0 = disabled).
    pub keepalive_interval: Duration,
    /// Silence tolerated after a keepalive.
    pub keepalive_timeout: Duration,
}

impl ProviderSettings {
    /// Default settings for a provider.
    #[must_use]
    pub fn defaults(provider: ProviderId) -> Self {
        let (url, max_reconnect_attempts, reconnect_base_delay) = match provider {
            ProviderId::JsonControl => ("wss://ws.finnhub.io", 5, Duration::from_secs(1)),
            ProviderId::CombinedStream => {
                ("wss://stream.binance.com:9443/ws", 10, Duration::from_secs(1))
            }
            ProviderId::BinaryFrame => ("ws://127.0.0.1:9100/stream", 5, Duration::from_secs(2)),
        };

        Self {
            url: url.to_string(),
            api_token: None,
            max_reconnect_attempts,
            reconnect_base_delay,
            reconnect_max_delay: None,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(30),
        }
    }

    /// URL to connect to, including the token if one is configured.
    #[must_use]
    pub fn base_url(&self) -> String {
        match &self.api_token {
            Some(token) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{separator}token={}", self.url, token.expose())
            }
            None => self.url.clone(),
        }
    }

    /// Load a provider's settings from variables under `prefix`.
    fn from_lookup<F>(provider: ProviderId, prefix: &str, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::defaults(provider);
        let key = |suffix: &str| format!("{prefix}{suffix}");

        let url = match lookup(&key("URL")) {
            Some(url) if url.trim().is_empty() => return Err(ConfigError::EmptyValue(key("URL"))),
            Some(url) => url.trim().to_string(),
            None => defaults.url,
        };
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: key("URL"),
                reason: format!("expected a ws:// or wss:// URL, got {url}"),
            });
        }

        Ok(Self {
            url,
            api_token: lookup(&key("TOKEN"))
                .filter(|t| !t.trim().is_empty())
                .map(ApiToken::new),
            max_reconnect_attempts: parse_env_u32(
                lookup,
                &key("MAX_RECONNECT_ATTEMPTS"),
                defaults.max_reconnect_attempts,
            ),
            reconnect_base_delay: parse_env_duration_millis(
                lookup,
                &key("RECONNECT_BASE_DELAY_MS"),
                defaults.reconnect_base_delay,
            ),
            reconnect_max_delay: lookup(&key("RECONNECT_MAX_DELAY_MS"))
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(defaults.reconnect_max_delay, |ms| {
                    (ms > 0).then(|| Duration::from_millis(ms))
                }),
            keepalive_interval: parse_env_duration_secs(
                lookup,
                &key("KEEPALIVE_INTERVAL_SECS"),
                defaults.keepalive_interval,
            ),
            keepalive_timeout: parse_env_duration_secs(
                lookup,
                &key("KEEPALIVE_TIMEOUT_SECS"),
                defaults.keepalive_timeout,
            ),
        })
    }
}

/// Complete streaming configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// JSON-control provider.
    pub json_control: ProviderSettings,
    /// Combined-stream provider.
    pub combined_stream: ProviderSettings,
    /// Binary-frame provider.
    pub binary_frame: ProviderSettings,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
    /// Provider the binary attaches its consumer to.
    pub provider: ProviderId,
    /// Symbols the binary attaches at startup.
    pub symbols: Vec<Symbol>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            json_control: ProviderSettings::defaults(ProviderId::JsonControl),
            combined_stream: ProviderSettings::defaults(ProviderId::CombinedStream),
            binary_frame: ProviderSettings::defaults(ProviderId::BinaryFrame),
            metrics_port: 9090,
            provider: ProviderId::JsonControl,
            symbols: Vec::new(),
        }
    }
}

impl StreamSettings {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider URL is empty or not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider URL is empty or not a WebSocket URL.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let provider = match lookup("QUOTE_STREAM_PROVIDER") {
            Some(name) => ProviderId::parse(&name).unwrap_or_else(|| {
                tracing::warn!(provider = %name, "Unknown provider, using default");
                defaults.provider
            }),
            None => defaults.provider,
        };

        let symbols = lookup("QUOTE_STREAM_SYMBOLS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            json_control: ProviderSettings::from_lookup(
                ProviderId::JsonControl,
                "QUOTE_STREAM_JSON_CONTROL_",
                &lookup,
            )?,
            combined_stream: ProviderSettings::from_lookup(
                ProviderId::CombinedStream,
                "QUOTE_STREAM_COMBINED_",
                &lookup,
            )?,
            binary_frame: ProviderSettings::from_lookup(
                ProviderId::BinaryFrame,
                "QUOTE_STREAM_BINARY_",
                &lookup,
            )?,
            metrics_port: parse_env_u16(&lookup, "QUOTE_STREAM_METRICS_PORT", defaults.metrics_port),
            provider,
            symbols,
        })
    }

    /// Settings for a provider.
    #[must_use]
    pub const fn provider(&self, provider: ProviderId) -> &ProviderSettings {
        match provider {
            ProviderId::JsonControl => &self.json_control,
            ProviderId::CombinedStream => &self.combined_stream,
            ProviderId::BinaryFrame => &self.binary_frame,
        }
    }

    /// Mutable settings for a provider.
    pub const fn provider_mut(&mut self, provider: ProviderId) -> &mut ProviderSettings {
        match provider {
            ProviderId::JsonControl => &mut self.json_control,
            ProviderId::CombinedStream => &mut self.combined_stream,
            ProviderId::BinaryFrame => &mut self.binary_frame,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

fn parse_env_u16<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u16) -> u16 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u32) -> u32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F: Fn(&str) -> Option<String>>(
    lookup: &F,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
