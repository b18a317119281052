//! Attempt states and outcomes.

use std::fmt;

use serde::Serialize;

use crate::error::{FailureKind, StreamError};

/// Negotiation attempt state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptState {
    /// No attempt in flight
    Idle,
    /// Waiting for a stream request
    Waiting,
    /// Request received, applying the accept policy
    Deciding,
    /// Accepting the request and opening the channel
    Accepting,
    /// Receiving, transforming and sending over the channel
    Exchanging,
}

impl AttemptState {
    /// Lowercase step name for status lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Deciding => "deciding",
            Self::Accepting => "accepting",
            Self::Exchanging => "exchanging",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classified failure of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Failure classification
    pub kind: FailureKind,
    /// State the attempt was in when it failed
    pub step: AttemptState,
    /// Underlying error message
    pub message: String,
}

impl Failure {
    /// Classify an error raised during `step`.
    pub fn classify(step: AttemptState, err: &StreamError) -> Self {
        Self {
            kind: err.failure_kind(),
            step,
            message: err.to_string(),
        }
    }
}

/// Result of one negotiation attempt.
///
/// Failures are values, not errors: every variant is something the caller
/// logs and moves on from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NegotiationOutcome {
    /// The deadline passed without a stream request.
    NoRequest,
    /// A request arrived and was rejected by policy.
    Rejected {
        /// Rejected request ID
        request_id: String,
    },
    /// A request was accepted and one exchange completed.
    Exchanged {
        /// Text received from the service
        msg_in: String,
        /// Text sent back
        msg_out: String,
    },
    /// The attempt failed.
    Failed(Failure),
}

impl NegotiationOutcome {
    /// Check if the attempt failed
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Failure classification, if the attempt failed
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed(failure) => Some(failure.kind),
            _ => None,
        }
    }
}

impl fmt::Display for NegotiationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRequest => write!(f, "No stream request received"),
            Self::Rejected { request_id } => write!(f, "Rejected stream request {request_id}"),
            Self::Exchanged { msg_in, msg_out } => {
                write!(f, "Stream exchange complete: received {msg_in:?}, sent {msg_out:?}")
            },
            Self::Failed(failure) => write!(
                f,
                "Stream attempt failed while {}: {} ({})",
                failure.step, failure.kind, failure.message
            ),
        }
    }
}
