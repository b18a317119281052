//! Session statistics.

use std::time::Instant;

use serde::Serialize;

use crate::protocol::NegotiationOutcome;

/// Per-session counters, one entry per negotiation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Session ID
    pub session_id: String,
    /// Attempts run
    pub attempts: u64,
    /// Attempts that completed an exchange
    pub exchanged: u64,
    /// Attempts that rejected a request
    pub rejected: u64,
    /// Attempts that saw no request
    pub empty: u64,
    /// Attempts that failed
    pub failed: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Session uptime in seconds
    pub uptime_secs: u64,
    #[serde(skip)]
    started: Instant,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    /// Start counting for a new session
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            attempts: 0,
            exchanged: 0,
            rejected: 0,
            empty: 0,
            failed: 0,
            bytes_received: 0,
            bytes_sent: 0,
            uptime_secs: 0,
            started: Instant::now(),
        }
    }

    /// Record one attempt outcome
    pub fn record(&mut self, outcome: &NegotiationOutcome) {
        self.attempts += 1;
        match outcome {
            NegotiationOutcome::NoRequest => self.empty += 1,
            NegotiationOutcome::Rejected { .. } => self.rejected += 1,
            NegotiationOutcome::Exchanged { msg_in, msg_out } => {
                self.exchanged += 1;
                self.bytes_received += msg_in.len() as u64;
                self.bytes_sent += msg_out.len() as u64;
            },
            NegotiationOutcome::Failed(_) => self.failed += 1,
        }
        self.uptime_secs = self.started.elapsed().as_secs();
    }

    /// Fraction of attempts that completed an exchange
    pub fn exchange_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.exchanged as f64 / self.attempts as f64
        }
    }
}
