//! Error types for configuration and event decoding.
//!
//! None of these ever reach the agent execution path: the hook logs and
//! swallows them.

use thiserror::Error;

/// Errors raised while parsing [`OtelConfig`](crate::config::OtelConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration value is not a JSON object.
    #[error("configuration must be a JSON object")]
    NotAnObject,

    /// A field has the wrong type or an unknown enum value.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("sampling_rate {0} is outside [0.0, 1.0]")]
    SamplingRate(f64),

    #[error("{0} must be greater than zero")]
    ZeroSized(&'static str),
}

/// Errors raised while decoding a raw kernel event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// The event name is not one the hook subscribes to.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The payload carries no usable `session_id`.
    #[error("event {event} has no session_id")]
    MissingSessionId { event: String },
}

impl EventError {
    /// Returns `true` for events the hook never registered for.
    #[inline]
    pub fn is_unknown_event(&self) -> bool {
        matches!(self, Self::UnknownEvent(_))
    }
}
