//! Stream agent error types.
//!
//! Every collaborator call (broker RPC, channel I/O) returns [`StreamError`].
//! Errors never escape a negotiation attempt: the negotiator folds them into a
//! [`FailureKind`] via [`StreamError::failure_kind`] and reports the attempt as
//! a failed outcome instead.
//!
//! Deadline expiry is signalled structurally with
//! [`StreamError::AttemptCancelled`]. Opaque transports that only surface a
//! message string are reclassified with [`is_timeout_message`] as a fallback.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Stream agent errors.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The broker could not be reached (connection refused, dropped link).
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The device identity or the stream target is unknown to the broker.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The per-attempt deadline elapsed before the step completed.
    #[error("Attempt deadline elapsed")]
    AttemptCancelled,

    /// The caller cancelled the session.
    #[error("Operation cancelled")]
    OperationCancelled,

    /// Any other transport failure, carrying the underlying message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed device connection string.
    #[error("Invalid connection string: {0}")]
    ConnectionString(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(io::Error),
}

/// Result type alias for stream agent operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Outcome-level failure classification of a negotiation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FailureKind {
    /// Broker connection failure.
    BrokerUnreachable,
    /// Device or stream target not found.
    DeviceOrTargetNotFound,
    /// The attempt deadline elapsed mid-step.
    AttemptCancelled,
    /// The caller cancelled the attempt.
    OperationCancelled,
    /// Catch-all transport failure.
    TransportError,
}

impl FailureKind {
    /// Short human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::BrokerUnreachable => "broker connection failure",
            Self::DeviceOrTargetNotFound => "device not found",
            Self::AttemptCancelled => "timeout",
            Self::OperationCancelled => "operation cancelled",
            Self::TransportError => "transport error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl StreamError {
    /// Classify this error for the attempt outcome.
    ///
    /// A transport message that mentions a timeout is treated as a deadline
    /// expiry, since legacy transports report it no other way.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::BrokerUnreachable(_) => FailureKind::BrokerUnreachable,
            Self::DeviceNotFound(_) => FailureKind::DeviceOrTargetNotFound,
            Self::AttemptCancelled => FailureKind::AttemptCancelled,
            Self::OperationCancelled => FailureKind::OperationCancelled,
            Self::Transport(msg) if is_timeout_message(msg) => FailureKind::AttemptCancelled,
            Self::Io(err) if err.kind() == io::ErrorKind::TimedOut => {
                FailureKind::AttemptCancelled
            },
            Self::Transport(_) | Self::ConnectionString(_) | Self::Config(_) | Self::Io(_) => {
                FailureKind::TransportError
            },
        }
    }
}

/// Check whether an opaque transport message describes a timeout.
pub fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timeout") || lower.contains("timed out")
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            StreamError::AttemptCancelled
        } else {
            StreamError::Io(err)
        }
    }
}

impl From<tungstenite::Error> for StreamError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => io_err.into(),
            other => StreamError::Transport(other.to_string()),
        }
    }
}

impl From<tungstenite::http::header::InvalidHeaderValue> for StreamError {
    fn from(err: tungstenite::http::header::InvalidHeaderValue) -> Self {
        StreamError::Transport(format!("Invalid authorization header: {err}"))
    }
}

impl From<toml::de::Error> for StreamError {
    fn from(err: toml::de::Error) -> Self {
        StreamError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for StreamError {
    fn from(err: toml::ser::Error) -> Self {
        StreamError::Config(err.to_string())
    }
}
