//! Unified error surface for the engine.
//!
//! Every fallible cross-component operation resolves to an [`EvoluError`].
//! Component-local error types convert into it at the component boundary so
//! the orchestrator can apply one retry/terminate/escalate policy.

use crate::timestamp::TimestampError;

/// Engine-wide error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvoluError {
    /// Local clock outside the acceptable window.
    #[error("clock drift of {drift_ms} ms exceeds the allowed window")]
    ClockDrift {
        /// Measured distance from the wall clock.
        drift_ms: u64,
    },

    /// Too many events in one millisecond.
    #[error("timestamp counter overflow within a single millisecond")]
    CounterOverflow,

    /// Unauthorized write to a relay.
    #[error("write key rejected")]
    WriteKeyInvalid,

    /// Protocol version mismatch between peers.
    #[error("peer speaks protocol version {peer}, ours is {ours}")]
    VersionUnsupported {
        /// Version byte presented by the peer.
        peer: u8,
        /// Version this build speaks.
        ours: u8,
    },

    /// AEAD open failed: tampering or a wrong key.
    #[error("message decryption failed")]
    Decrypt,

    /// Persistence failed. The message stays free of SQL detail; the
    /// storage layer logs specifics at debug level.
    #[error("storage error: {message}")]
    Storage {
        /// Human-readable cause.
        message: String,
    },

    /// Network failed.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable cause.
        message: String,
    },

    /// Malformed or out-of-order protocol input.
    #[error("protocol error: {message}")]
    Protocol {
        /// Human-readable cause.
        message: String,
    },

    /// Encoding or decoding of a model type failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable cause.
        message: String,
    },

    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl EvoluError {
    /// Storage failure with a cause.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Transport failure with a cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Protocol violation with a cause.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Serialization failure with a cause.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// True for failures the orchestrator retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Storage { .. })
    }
}

impl From<TimestampError> for EvoluError {
    fn from(err: TimestampError) -> Self {
        match err {
            TimestampError::ClockDrift { drift_ms } => Self::ClockDrift { drift_ms },
            TimestampError::CounterOverflow => Self::CounterOverflow,
            other => Self::protocol(other.to_string()),
        }
    }
}
