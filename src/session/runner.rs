//! End-to-end session orchestration.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::stats::SessionStats;
use crate::config::SessionConfig;
use crate::error::{Result, StreamError};
use crate::protocol::{StreamNegotiator, TextTransform, CONNECTION_CLOSE_GRACE};
use crate::transport::{
    BrokerConnection, ChannelFactory, ConnectionFactory, ConnectionString, TransportKind,
};

/// Runs device stream sessions against a broker.
///
/// One runner owns one cancellation token; [`cancel`](Self::cancel) aborts
/// the attempt in flight and every attempt after it. Runners share nothing,
/// so several can run concurrently, one per device identity.
pub struct SessionRunner {
    connections: Arc<dyn ConnectionFactory>,
    channels: Arc<dyn ChannelFactory>,
    config: SessionConfig,
    transport: TransportKind,
    cancel: CancellationToken,
}

impl SessionRunner {
    /// Create a runner with default session settings
    pub fn new(connections: Arc<dyn ConnectionFactory>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self {
            connections,
            channels,
            config: SessionConfig::default(),
            transport: TransportKind::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the session settings
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the broker transport
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Loop attempts until cancelled instead of running one
    pub fn keep_listening(mut self, keep_listening: bool) -> Self {
        self.config.keep_listening = keep_listening;
        self
    }

    /// Accept (true) or reject (false) incoming stream requests
    pub fn accept_requests(mut self, accept: bool) -> Self {
        self.config.accept_requests = accept;
        self
    }

    /// Get the session settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Cancel the running session and all future attempts
    pub fn cancel(&self) {
        tracing::info!("Session cancellation requested");
        self.cancel.cancel();
    }

    /// Token that cancels this runner when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check if the runner has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one session.
    ///
    /// Opens a broker connection from `connection_string`, then negotiates
    /// once, or repeatedly while `keep_listening` is set and the runner is not
    /// cancelled. Every attempt reports exactly one line to `on_status`.
    ///
    /// Only a failure to open the connection is returned as an error; it is
    /// reported to `on_status` as well and no attempt is made.
    pub async fn run_session<F, S>(
        &self,
        connection_string: &str,
        transform: Option<F>,
        on_status: S,
    ) -> Result<SessionStats>
    where
        F: Fn(&str) -> String + Send + Sync,
        S: Fn(&str) + Send + Sync,
    {
        self.run_session_with(
            connection_string,
            transform,
            on_status,
            self.config.keep_listening,
            self.config.accept_requests,
        )
        .await
    }

    /// Run one session with an explicit listening and accept policy.
    ///
    /// Same as [`run_session`](Self::run_session), but `keep_listening` and
    /// `accept` override the configured values for this run only.
    pub async fn run_session_with<F, S>(
        &self,
        connection_string: &str,
        transform: Option<F>,
        on_status: S,
        keep_listening: bool,
        accept: bool,
    ) -> Result<SessionStats>
    where
        F: Fn(&str) -> String + Send + Sync,
        S: Fn(&str) + Send + Sync,
    {
        let connection = match self.open(connection_string).await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::error!("Failed to open broker connection: {}", err);
                on_status(&format!("Failed to open broker connection: {err}"));
                return Err(err);
            },
        };

        let transform = transform.as_ref().map(|f| f as &TextTransform<'_>);
        let negotiator = StreamNegotiator::new(self.channels.as_ref(), transform)
            .with_cancellation(self.cancel.clone())
            .with_receive_buffer_size(self.config.receive_buffer_size);

        let mut stats = SessionStats::new();
        tracing::info!(
            "Session {} started (keep listening: {}, accept: {}, timeout: {:?})",
            stats.session_id,
            keep_listening,
            accept,
            self.config.timeout()
        );

        loop {
            let outcome = negotiator
                .negotiate(connection.as_ref(), accept, self.config.timeout())
                .await;
            stats.record(&outcome);
            on_status(&outcome.to_string());

            if !keep_listening || self.cancel.is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
        }

        match tokio::time::timeout(CONNECTION_CLOSE_GRACE, connection.close()).await {
            Ok(Ok(())) => {},
            Ok(Err(err)) => tracing::warn!("Connection close failed: {}", err),
            Err(_) => tracing::warn!("Connection close timed out"),
        }

        tracing::info!(
            "Session {} finished after {} attempts ({} exchanged, {} rejected, {} empty, {} failed)",
            stats.session_id,
            stats.attempts,
            stats.exchanged,
            stats.rejected,
            stats.empty,
            stats.failed
        );
        Ok(stats)
    }

    /// Parse the connection string and open the broker connection.
    async fn open(&self, connection_string: &str) -> Result<Box<dyn BrokerConnection>> {
        let parsed: ConnectionString = connection_string.parse()?;
        tracing::info!(
            "Opening broker connection {} over {}",
            parsed.redacted(),
            self.transport
        );

        let open = self.connections.open(&parsed, self.transport);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::OperationCancelled),
            result = tokio::time::timeout(self.config.timeout(), open) => {
                result.map_err(|_| StreamError::AttemptCancelled)?
            },
        }
    }
}
