//! Device session management.
//!
//! A session owns one broker connection and runs negotiation attempts over
//! it until it is told to stop.
//!
//! ```text
//!            open(connection string)
//!   [Start] ────────────────────────> [Connected] ──── open failed ───> report, return Err
//!                                         │
//!                                         v
//!                              ┌──> negotiate (one attempt) ──> report status line
//!                              │          │
//!                              │          │ keep_listening && !cancelled
//!                              └──────────┘
//!                                         │ otherwise
//!                                         v
//!                                 close connection, return stats
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use devstream::session::SessionRunner;
//! use devstream::transport::LoopbackHub;
//!
//! let hub = Arc::new(LoopbackHub::new());
//! let runner = SessionRunner::new(hub.clone(), hub.clone()).keep_listening(true);
//!
//! let stats = runner
//!     .run_session(
//!         "HostName=loopback;DeviceId=dev-1;SharedAccessKey=a2V5",
//!         Some(|msg: &str| msg.to_uppercase()),
//!         |status: &str| println!("{status}"),
//!     )
//!     .await?;
//! ```

mod runner;
mod stats;

pub use runner::SessionRunner;
pub use stats::SessionStats;
