//! Reconnection Policy
//!
//! Exponential backoff for streaming reconnects: attempt `n` waits
//! `base × 2^(n−1)`, optionally capped and jittered. Once `max_attempts`
//! delays have been handed out the policy is exhausted until reset.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ProviderSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay, if set.
    pub max_delay: Option<Duration>,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = never reconnect).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: None,
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Create a configuration without jitter or ceiling.
    #[must_use]
    pub const fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay: None,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Create configuration from provider settings.
    #[must_use]
    pub const fn from_provider_settings(settings: &ProviderSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base_delay,
            max_delay: settings.reconnect_max_delay,
            jitter_factor: 0.0,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Set the delay ceiling.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Set the jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Un-jittered delay for the one-based attempt `n`.
    ///
    /// Saturates instead of overflowing for large `n`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(ceiling) => delay.min(ceiling),
            None => delay,
        }
    }
}

/// Reconnect attempt counter with exponential backoff.
///
/// # Example
///
/// ```rust
/// use quote_stream::infrastructure::stream::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_millis(100), 2));
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(policy.next_delay(), None);
///
/// // Simulate successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Count an attempt and return how long to wait before it.
    ///
    /// Returns `None` once `max_attempts` have been made.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        Some(self.apply_jitter(self.config.delay_for_attempt(self.attempt_count)))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt_count < self.config.max_attempts
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Spread a delay by up to `jitter_factor` in either direction.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if !factor.is_finite() || factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread: f64 = rand::rng().random_range(-factor..=factor);
        delay
            .mul_f64((1.0 + spread).max(0.0))
            .max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::domain::streaming::ProviderId;

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, None);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 5);
    }

    #[test_case(1, 1_000 ; "first attempt uses base")]
    #[test_case(2, 2_000 ; "second attempt doubles")]
    #[test_case(3, 4_000 ; "third attempt")]
    #[test_case(5, 16_000 ; "fifth attempt")]
    fn delay_doubles_per_attempt(attempt: u32, millis: u64) {
        let config = ReconnectConfig::new(Duration::from_secs(1), 10);
        assert_eq!(config.delay_for_attempt(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn delay_saturates_for_huge_attempts() {
        let config = ReconnectConfig::new(Duration::from_secs(1), u32::MAX);
        assert!(config.delay_for_attempt(200) >= Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn provider_defaults_double_through_the_last_attempt() {
        for &provider in ProviderId::all() {
            let settings = ProviderSettings::defaults(provider);
            let config = ReconnectConfig::from_provider_settings(&settings);
            let last = settings.max_reconnect_attempts;

            assert_eq!(
                config.delay_for_attempt(last),
                settings.reconnect_base_delay * 2u32.pow(last - 1),
                "{provider}"
            );
        }
    }

    #[test]
    fn ceiling_caps_delay() {
        let config =
            ReconnectConfig::new(Duration::from_secs(1), 10).with_max_delay(Duration::from_secs(3));

        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(3));
    }

    #[test]
    fn policy_max_attempts() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_millis(100), 3));

        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(policy.attempt_count(), 3);

        // No fourth attempt
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 3);
        assert!(!policy.should_retry());
    }

    #[test]
    fn zero_attempts_never_reconnects() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_millis(100), 0));
        assert!(!policy.should_retry());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn policy_reset() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_millis(100), 3));

        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(
                ReconnectConfig::new(Duration::from_millis(1000), 1).with_jitter(0.1),
            );

            let millis = policy.next_delay().unwrap().as_millis();

            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }
}
