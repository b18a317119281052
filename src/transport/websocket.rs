//! Websocket stream channel.
//!
//! The broker hands the device a `wss://` endpoint and a bearer token with
//! each stream request. The device upgrades to a websocket there and the
//! service on the other side exchanges frames with it.
//!
//! `wss://` endpoints are verified against the bundled webpki roots using
//! the rustls `ring` provider.

use std::borrow::Cow;
use std::sync::Once;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{ChannelFactory, StreamChannel};
use crate::error::{Result, StreamError};
use crate::protocol::Deadline;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the process-wide rustls provider unless the application already did.
fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Opens websocket channels to broker-issued stream endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebSocketChannelFactory;

impl WebSocketChannelFactory {
    /// Create a websocket channel factory
    pub fn new() -> Self {
        Self
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn open_channel<'a>(
        &'a self,
        url: &'a str,
        authorization_token: &'a str,
        deadline: Deadline,
    ) -> BoxFuture<'a, Result<Box<dyn StreamChannel>>> {
        Box::pin(async move {
            ensure_crypto_provider();
            let mut request = url.into_client_request()?;
            let bearer = format!("Bearer {authorization_token}").parse()?;
            request.headers_mut().insert(AUTHORIZATION, bearer);

            let connect = connect_async(request);
            let (socket, response) = tokio::time::timeout_at(deadline.instant(), connect)
                .await
                .map_err(|_| StreamError::AttemptCancelled)??;
            tracing::debug!("Stream channel open to {} ({})", url, response.status());

            let channel: Box<dyn StreamChannel> = Box::new(WebSocketChannel { socket });
            Ok(channel)
        })
    }
}

/// Websocket-backed stream channel.
pub struct WebSocketChannel {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StreamChannel for WebSocketChannel {
    fn receive<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
        _deadline: Deadline,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            loop {
                let payload = match self.socket.next().await {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(StreamError::Transport(
                            "Stream channel closed by peer".to_string(),
                        ));
                    },
                    Some(Err(err)) => return Err(err.into()),
                };
                let len = payload.len().min(buffer.len());
                buffer[..len].copy_from_slice(&payload[..len]);
                return Ok(len);
            }
        })
    }

    fn send<'a>(&'a mut self, frame: &'a [u8], _deadline: Deadline) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.socket.send(Message::Binary(frame.to_vec())).await?;
            Ok(())
        })
    }

    fn close(&mut self, _deadline: Deadline) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            };
            self.socket.close(Some(frame)).await?;
            Ok(())
        })
    }
}
