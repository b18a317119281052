//! Device stream negotiation.
//!
//! Implements the device side of a broker-mediated stream: wait for a
//! stream request, accept or reject it, and run exactly one text exchange
//! over the channel the request points at.
//!
//! # Protocol Overview
//!
//! A remote service asks the broker to open a stream to a device. The broker
//! forwards a stream request; the device decides, and on acceptance connects
//! to the endpoint carried by the request using its authorization token.
//!
//! ## Message Flow
//!
//! ```text
//! Device                      Broker                      Service
//!    |                           |<------ open stream -------|
//!    |<---- stream request ------|                           |
//!    |----- ACCEPT / REJECT ---->|                           |
//!    |                           |                           |
//!    |======== channel open (url + token) ==================>|
//!    |<======= one frame in =================================|
//!    |======== one frame out = transform(in) ===============>|
//!    |-------- close ------------------------------------------>|
//! ```
//!
//! ## State Machine
//!
//! Each attempt walks these states and returns to `Idle`:
//!
//! | State        | Description                         | Exits                              |
//! |--------------|-------------------------------------|------------------------------------|
//! | `Idle`       | No attempt in flight                | → Waiting                          |
//! | `Waiting`    | Blocked on an incoming request      | → Idle (NoRequest), Deciding       |
//! | `Deciding`   | Request in hand, policy applied     | → Idle (Rejected), Accepting       |
//! | `Accepting`  | Accept RPC and channel open         | → Exchanging, Idle (Failed)        |
//! | `Exchanging` | One receive, one send, close        | → Idle (Exchanged / Failed)        |
//!
//! ## Deadlines and Cancellation
//!
//! One [`Deadline`] is taken when the attempt starts and shared by every
//! step; it is never renewed. An external `CancellationToken` composes with
//! it. Deadline expiry while waiting is an empty cycle (`NoRequest`); anywhere
//! else it is `AttemptCancelled`. Cancellation is always `OperationCancelled`.

mod deadline;
mod negotiator;
mod outcome;
mod request;

pub use deadline::Deadline;
pub use negotiator::{StreamNegotiator, TextTransform};
pub use outcome::{AttemptState, Failure, NegotiationOutcome};
pub use request::StreamRequest;

use std::time::Duration;

/// Size of the single receive buffer (one frame).
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

/// Default per-attempt timeout
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the final broker connection close of an attempt.
pub const CONNECTION_CLOSE_GRACE: Duration = Duration::from_secs(2);
