//! # devstream - Device-side Stream Negotiation
//!
//! Device agent for broker-mediated point-to-point streams. A cloud service
//! asks the broker for a stream to a device; the device waits for that
//! request, accepts or rejects it, and on acceptance runs a single
//! receive/transform/send exchange over a raw duplex channel.
//!
//! ## Features
//!
//! - **Single-attempt negotiation**: wait, decide, exchange, close; one deadline per attempt
//! - **Uniform outcomes**: every attempt reports exactly one [`NegotiationOutcome`]
//! - **Failure classification**: broker, not-found, timeout, cancellation, transport
//! - **Session loop**: keep listening across attempts until cancelled
//! - **Pluggable transports**: broker and channel seams are traits; loopback and
//!   websocket implementations are included
//!
//! ## Protocol Overview
//!
//! ```text
//! Service                        Broker                          Device
//!    |                              |                                |
//!    |------ stream request ------->|                                |
//!    |                              |------ request (url, token) --->|
//!    |                              |<----- accept / reject ---------|
//!    |<----- url, token ------------|                                |
//!    |                              |                                |
//!    |<============ raw channel (one frame each way) ===============>|
//! ```
//!
//! ### Outcomes
//!
//! | Outcome     | When                                              |
//! |-------------|---------------------------------------------------|
//! | `NoRequest` | No request arrived before the deadline            |
//! | `Rejected`  | A request arrived and the device declined it      |
//! | `Exchanged` | One frame received, transformed and sent back     |
//! | `Failed`    | Any step failed; carries a classified `FailureKind` |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use devstream::{LoopbackHub, SessionRunner};
//!
//! let hub = Arc::new(LoopbackHub::new());
//! let runner = SessionRunner::new(hub.clone(), hub.clone());
//!
//! let service = hub.clone();
//! tokio::spawn(async move { service.initiate("dev-1", "hello").await });
//!
//! runner
//!     .run_session(
//!         "HostName=loopback;DeviceId=dev-1;SharedAccessKey=a2V5",
//!         Some(|msg: &str| msg.to_uppercase()),
//!         |status: &str| println!("{status}"),
//!     )
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Single-attempt negotiation, outcomes and deadlines
//! - [`session`]: Session runner and statistics
//! - [`transport`]: Broker and channel seams, connection strings, loopback and websocket
//! - [`config`]: Configuration management
//! - [`error`]: Error types and failure classification

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, SessionConfig};
pub use error::{FailureKind, Result, StreamError};
pub use protocol::{Deadline, NegotiationOutcome, StreamNegotiator, StreamRequest};
pub use session::{SessionRunner, SessionStats};
pub use transport::{
    BrokerConnection, ChannelFactory, ConnectionFactory, ConnectionString, LoopbackHub,
    StreamChannel, TransportKind, WebSocketChannelFactory,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
