//! Streaming Connection Types
//!
//! Provider identity, the four-state connection lifecycle and the events
//! and errors a streaming connection reports to its observers.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Provider Identity
// =============================================================================

/// Upstream quote provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderId {
    /// JSON feed with per-symbol subscribe control messages.
    JsonControl,
    /// Combined-stream feed with URL-embedded subscriptions and keyed ping/pong.
    CombinedStream,
    /// Binary tag-length-value feed.
    BinaryFrame,
}

impl ProviderId {
    /// Get all providers.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::JsonControl, Self::CombinedStream, Self::BinaryFrame]
    }

    /// Get the provider name used in logs, metrics and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::JsonControl => "json_control",
            Self::CombinedStream => "combined_stream",
            Self::BinaryFrame => "binary_frame",
        }
    }

    /// Parse a provider name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "json_control" | "json" => Some(Self::JsonControl),
            "combined_stream" | "combined" => Some(Self::CombinedStream),
            "binary_frame" | "binary" => Some(Self::BinaryFrame),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket and no pending reconnect.
    #[default]
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Socket open and streaming.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Numeric value exported as the connection state gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
        }
    }

    /// Check if a connect attempt is underway or pending.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates connection lifecycle transitions.
pub struct ConnectionStateMachine;

impl ConnectionStateMachine {
    /// Check if a state transition is valid.
    #[must_use]
    pub const fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        matches!(
            (from, to),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                // Handshake outcome
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Reconnecting)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                // Unexpected close or explicit disconnect
                | (ConnectionState::Connected, ConnectionState::Reconnecting)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
                // Backoff elapsed, exhausted or cancelled
                | (ConnectionState::Reconnecting, ConnectionState::Connecting)
                | (ConnectionState::Reconnecting, ConnectionState::Disconnected)
        )
    }

    /// Validate a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the transition is not allowed.
    pub const fn validate_transition(
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), InvalidTransition> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(InvalidTransition { from, to })
        }
    }

    /// Get all valid next states from a given state.
    #[must_use]
    pub fn valid_next_states(from: ConnectionState) -> Vec<ConnectionState> {
        match from {
            ConnectionState::Disconnected => vec![ConnectionState::Connecting],
            ConnectionState::Connecting => vec![
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Disconnected,
            ],
            ConnectionState::Connected => {
                vec![ConnectionState::Reconnecting, ConnectionState::Disconnected]
            }
            ConnectionState::Reconnecting => {
                vec![ConnectionState::Connecting, ConnectionState::Disconnected]
            }
        }
    }
}

/// A rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid connection transition from {from} to {to}")]
pub struct InvalidTransition {
    /// State the connection was in.
    pub from: ConnectionState,
    /// State that was requested.
    pub to: ConnectionState,
}

// =============================================================================
// Errors and Events
// =============================================================================

/// Errors surfaced to connection observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Reconnect budget spent; the connection is now disconnected.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Transport-level failure (handshake, socket I/O, close).
    #[error("transport error: {0}")]
    Transport(String),

    /// Error message reported by the provider.
    #[error("provider error: {0}")]
    Protocol(String),

    /// Inbound frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Connection was explicitly disconnected.
    #[error("connection disconnected")]
    Disconnected,
}

/// Notifications published by a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection changed state.
    StatusChanged {
        /// Provider of the connection.
        provider: ProviderId,
        /// New state.
        state: ConnectionState,
    },
    /// A reconnect attempt was scheduled.
    Reconnecting {
        /// Provider of the connection.
        provider: ProviderId,
        /// One-based attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// A decode, provider or terminal error.
    Error {
        /// Provider of the connection.
        provider: ProviderId,
        /// The error.
        error: StreamError,
    },
}

impl ConnectionEvent {
    /// Provider the event belongs to.
    #[must_use]
    pub const fn provider(&self) -> ProviderId {
        match self {
            Self::StatusChanged { provider, .. }
            | Self::Reconnecting { provider, .. }
            | Self::Error { provider, .. } => *provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
    ];

    #[test]
    fn valid_next_states_agree_with_transition_table() {
        for from in ALL_STATES {
            for to in ALL_STATES {
                assert_eq!(
                    ConnectionStateMachine::is_valid_transition(from, to),
                    ConnectionStateMachine::valid_next_states(from).contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn disconnected_only_moves_to_connecting() {
        assert!(ConnectionStateMachine::is_valid_transition(
            ConnectionState::Disconnected,
            ConnectionState::Connecting
        ));
        assert!(!ConnectionStateMachine::is_valid_transition(
            ConnectionState::Disconnected,
            ConnectionState::Connected
        ));
        assert!(!ConnectionStateMachine::is_valid_transition(
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting
        ));
    }

    #[test]
    fn self_transitions_are_rejected() {
        for state in ALL_STATES {
            let err = ConnectionStateMachine::validate_transition(state, state).unwrap_err();
            assert_eq!(err.from, state);
        }
    }

    #[test]
    fn reconnecting_cannot_skip_handshake() {
        assert!(
            ConnectionStateMachine::validate_transition(
                ConnectionState::Reconnecting,
                ConnectionState::Connected
            )
            .is_err()
        );
    }

    #[test]
    fn provider_names_round_trip() {
        for provider in ProviderId::all() {
            assert_eq!(ProviderId::parse(provider.as_str()), Some(*provider));
        }
        assert_eq!(ProviderId::parse("Combined-Stream"), Some(ProviderId::CombinedStream));
        assert_eq!(ProviderId::parse("smoke-signals"), None);
    }

    #[test]
    fn exhausted_error_message() {
        let err = StreamError::ReconnectExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "reconnect attempts exhausted after 5 attempts");
    }
}
