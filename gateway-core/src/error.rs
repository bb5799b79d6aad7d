//! Gateway error types, structured the way `BrokerError`/`MonitoringError`
//! style enums are elsewhere in this kind of runtime.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur anywhere in the gateway — BackendRegistry loading,
/// broker dispatch, strategy selection, or the Sender's RPC call.
///
/// Each variant carries enough context to decide the right recovery: config
/// and backend-not-ready errors are fatal at startup, the rest are runtime
/// conditions the caller is expected to translate into a client-facing
/// outcome.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or invalid required configuration. Fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable description of the invalid/missing setting.
        message: String,
    },

    /// No backend responded healthy within the startup retry budget.
    #[error("no backend became ready within {attempts} attempts ({wait:?} apart)")]
    BackendNotReady {
        /// Number of attempts made.
        attempts: u32,
        /// Wait duration between attempts.
        wait: Duration,
    },

    /// The active healthy set was empty when a request needed dispatching.
    #[error("no healthy server available")]
    ServerNotFound,

    /// Admission gate rejected a publish because the queue was too deep.
    #[error("queue depth {depth} exceeds threshold {threshold}")]
    QueueOverloaded {
        /// Observed queue depth.
        depth: u32,
        /// The user's configured threshold.
        threshold: u32,
    },

    /// No dispatch reply arrived before the RPC call's timeout elapsed.
    #[error("dispatch timed out after {0:?}")]
    DispatchTimeout(Duration),

    /// The broker connection or a channel operation failed.
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// A message could not be interpreted (bad JSON, unknown routing mode,
    /// missing correlation id). Callers should log and ack, never retry.
    #[error("protocol error: {message}")]
    Protocol {
        /// Human-readable description of the malformed data.
        message: String,
    },
}

impl GatewayError {
    /// Build a [`GatewayError::Config`] from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::Protocol`] from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Convenience alias used across `gateway-core`, `consumer`, and `sender`.
pub type Result<T> = std::result::Result<T, GatewayError>;
