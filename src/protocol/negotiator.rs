//! Single-attempt stream negotiation.
//!
//! Handles one pass of wait, decide, and (on acceptance) the single
//! receive/transform/send exchange, against a borrowed broker connection.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::deadline::Deadline;
use super::outcome::{AttemptState, Failure, NegotiationOutcome};
use super::{CONNECTION_CLOSE_GRACE, RECEIVE_BUFFER_SIZE};
use crate::error::{Result, StreamError};
use crate::transport::{BrokerConnection, ChannelFactory, StreamChannel};

/// Caller-supplied text transform applied to each received frame.
pub type TextTransform<'a> = dyn Fn(&str) -> String + Send + Sync + 'a;

/// Stream negotiator
///
/// Borrows its channel factory and transform for the lifetime of a session;
/// the broker connection is only borrowed for the duration of one
/// [`negotiate`](Self::negotiate) call.
pub struct StreamNegotiator<'a> {
    /// Opens the duplex channel of an accepted request
    channels: &'a dyn ChannelFactory,
    /// Text transform (identity when absent)
    transform: Option<&'a TextTransform<'a>>,
    /// External cancellation
    cancel: CancellationToken,
    /// Receive buffer size (one frame)
    receive_buffer_size: usize,
}

impl<'a> StreamNegotiator<'a> {
    /// Create a negotiator bound to a channel factory and optional transform
    pub fn new(channels: &'a dyn ChannelFactory, transform: Option<&'a TextTransform<'a>>) -> Self {
        Self {
            channels,
            transform,
            cancel: CancellationToken::new(),
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
        }
    }

    /// Observe an external cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the receive buffer size
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    /// Get the cancellation token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one negotiation attempt.
    ///
    /// Never fails: every error is classified into
    /// [`NegotiationOutcome::Failed`]. The connection is closed before
    /// returning on every path.
    pub async fn negotiate(
        &self,
        connection: &dyn BrokerConnection,
        accept: bool,
        timeout: Duration,
    ) -> NegotiationOutcome {
        let deadline = Deadline::after(timeout);
        let mut state = AttemptState::Idle;

        let outcome = match self.attempt(connection, accept, deadline, &mut state).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!("Stream attempt failed while {}: {}", state, err);
                NegotiationOutcome::Failed(Failure::classify(state, &err))
            },
        };

        self.close_connection(connection).await;
        self.enter(&mut state, AttemptState::Idle);
        outcome
    }

    async fn attempt(
        &self,
        connection: &dyn BrokerConnection,
        accept: bool,
        deadline: Deadline,
        state: &mut AttemptState,
    ) -> Result<NegotiationOutcome> {
        self.enter(state, AttemptState::Waiting);
        let wait = connection.wait_for_stream_request(deadline);
        let request = match self.bounded(deadline, wait).await {
            Ok(Some(request)) => request,
            // Deadline while waiting is an empty cycle, not a failure
            Ok(None) | Err(StreamError::AttemptCancelled) => {
                return Ok(NegotiationOutcome::NoRequest)
            },
            Err(err) => return Err(err),
        };
        tracing::info!(
            "Stream request {} ({}) received",
            request.request_id,
            request.name
        );

        self.enter(state, AttemptState::Deciding);
        if !accept {
            let reject = connection.reject_stream_request(&request, deadline);
            self.bounded(deadline, reject).await?;
            tracing::info!("Stream request {} rejected", request.request_id);
            return Ok(NegotiationOutcome::Rejected {
                request_id: request.request_id,
            });
        }

        self.enter(state, AttemptState::Accepting);
        let accepting = connection.accept_stream_request(&request, deadline);
        self.bounded(deadline, accepting).await?;

        let open = self
            .channels
            .open_channel(&request.url, &request.authorization_token, deadline);
        let mut channel = self.bounded(deadline, open).await?;

        self.enter(state, AttemptState::Exchanging);
        match self.exchange(channel.as_mut(), deadline).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::debug!(
                    "Abandoning stream channel of request {}",
                    request.request_id
                );
                drop(channel);
                Err(err)
            },
        }
    }

    /// Receive one frame, transform it, send the result, close.
    async fn exchange(
        &self,
        channel: &mut dyn StreamChannel,
        deadline: Deadline,
    ) -> Result<NegotiationOutcome> {
        let mut buffer = vec![0u8; self.receive_buffer_size];
        let received = self
            .bounded(deadline, channel.receive(&mut buffer, deadline))
            .await?;
        let received = received.min(buffer.len());
        let msg_in = String::from_utf8_lossy(&buffer[..received]).into_owned();
        tracing::debug!("Received stream data: {} bytes", received);

        let msg_out = match self.transform {
            Some(transform) => transform(&msg_in),
            None => msg_in.clone(),
        };

        self.bounded(deadline, channel.send(msg_out.as_bytes(), deadline))
            .await?;
        tracing::debug!("Sent stream data: {} bytes", msg_out.len());

        // Best-effort: the exchange already happened
        if let Err(err) = self.bounded(deadline, channel.close(deadline)).await {
            tracing::warn!("Stream channel close failed: {}", err);
        }

        Ok(NegotiationOutcome::Exchanged { msg_in, msg_out })
    }

    /// Race a step against external cancellation and the attempt deadline.
    async fn bounded<T, F>(&self, deadline: Deadline, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::OperationCancelled),
            () = tokio::time::sleep_until(deadline.instant()) => Err(StreamError::AttemptCancelled),
            result = step => result,
        }
    }

    async fn close_connection(&self, connection: &dyn BrokerConnection) {
        match tokio::time::timeout(CONNECTION_CLOSE_GRACE, connection.close()).await {
            Ok(Ok(())) => {},
            Ok(Err(err)) => tracing::warn!("Connection close failed: {}", err),
            Err(_) => tracing::warn!(
                "Connection close did not finish within {:?}",
                CONNECTION_CLOSE_GRACE
            ),
        }
    }

    fn enter(&self, state: &mut AttemptState, next: AttemptState) {
        tracing::debug!("Attempt state {} -> {}", state, next);
        *state = next;
    }
}
