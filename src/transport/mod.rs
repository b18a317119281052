//! Transport layer abstraction for the device stream agent.
//!
//! The negotiator never talks to a network directly. It drives four
//! collaborator seams:
//!
//! - [`ConnectionFactory`]: opens a broker connection from a device
//!   [`ConnectionString`] and a [`TransportKind`]
//! - [`BrokerConnection`]: waits for stream requests and accepts/rejects them
//! - [`ChannelFactory`]: opens the raw duplex channel a request points at
//! - [`StreamChannel`]: one receive, one send, one close
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │     SessionRunner / StreamNegotiator     │
//! │          (Transport-Agnostic)            │
//! └─────────┬──────────────────────┬─────────┘
//!           ▼                      ▼
//! ┌───────────────────┐  ┌───────────────────┐
//! │ BrokerConnection  │  │  StreamChannel    │
//! │ (request RPCs)    │  │  (raw duplex)     │
//! └───────────────────┘  └───────────────────┘
//!   LoopbackHub            WebSocketChannel
//!                          LoopbackChannel
//! ```
//!
//! Every blocking call receives the attempt [`Deadline`]. Implementations may
//! use it to bound their own I/O; the negotiator enforces it regardless.

mod connection_string;
mod loopback;
mod websocket;

pub use connection_string::{ConnectionString, ConnectionSummary, Credential};
pub use loopback::{LoopbackChannel, LoopbackConnection, LoopbackHub, ServiceReply};
pub use websocket::{WebSocketChannel, WebSocketChannelFactory};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{Deadline, StreamRequest};

/// Broker transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// AMQP over TCP (default)
    #[default]
    Amqp,
    /// AMQP tunnelled through a websocket
    #[serde(rename = "amqp_ws")]
    AmqpWebSocket,
    /// MQTT over TCP
    Mqtt,
    /// MQTT tunnelled through a websocket
    #[serde(rename = "mqtt_ws")]
    MqttWebSocket,
}

impl TransportKind {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Amqp => "AMQP",
            Self::AmqpWebSocket => "AMQP/WS",
            Self::Mqtt => "MQTT",
            Self::MqttWebSocket => "MQTT/WS",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amqp" | "amqp_tcp" => Ok(Self::Amqp),
            "amqp_ws" | "amqp_websocket" | "amqp-ws" => Ok(Self::AmqpWebSocket),
            "mqtt" | "mqtt_tcp" => Ok(Self::Mqtt),
            "mqtt_ws" | "mqtt_websocket" | "mqtt-ws" => Ok(Self::MqttWebSocket),
            _ => Err(format!("Unknown transport kind: {}", s)),
        }
    }
}

/// Opens broker connections for a device identity.
pub trait ConnectionFactory: Send + Sync {
    /// Open a logical broker connection.
    fn open<'a>(
        &'a self,
        connection_string: &'a ConnectionString,
        transport: TransportKind,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerConnection>>>;
}

/// Broker-level logical connection of one device.
///
/// A closed connection re-establishes its link on the next
/// [`wait_for_stream_request`](Self::wait_for_stream_request), so one
/// connection can serve many negotiation attempts.
pub trait BrokerConnection: Send + Sync {
    /// Wait for an incoming stream request.
    ///
    /// Returns `Ok(None)` when the deadline passes without a request.
    fn wait_for_stream_request(
        &self,
        deadline: Deadline,
    ) -> BoxFuture<'_, Result<Option<StreamRequest>>>;

    /// Accept a pending stream request.
    fn accept_stream_request<'a>(
        &'a self,
        request: &'a StreamRequest,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<()>>;

    /// Reject a pending stream request.
    fn reject_stream_request<'a>(
        &'a self,
        request: &'a StreamRequest,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<()>>;

    /// Close the connection. Must be idempotent.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Opens the duplex byte channel of an accepted stream request.
pub trait ChannelFactory: Send + Sync {
    /// Connect to `url` authenticating with `authorization_token`.
    fn open_channel<'a>(
        &'a self,
        url: &'a str,
        authorization_token: &'a str,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<Box<dyn StreamChannel>>>;
}

/// Raw duplex byte channel carrying one frame in and one frame out.
pub trait StreamChannel: Send {
    /// Receive one frame into `buffer`, returning the number of bytes written.
    ///
    /// Frames longer than the buffer are truncated.
    fn receive<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<usize>>;

    /// Send one frame.
    fn send<'a>(&'a mut self, frame: &'a [u8], deadline: Deadline) -> BoxFuture<'a, Result<()>>;

    /// Best-effort graceful close.
    fn close(&mut self, deadline: Deadline) -> BoxFuture<'_, Result<()>>;
}
