//! Incoming stream request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stream request forwarded by the broker when a service wants a channel.
///
/// Consumed by exactly one negotiation attempt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Broker-assigned request ID
    pub request_id: String,
    /// Stream name chosen by the service
    pub name: String,
    /// Channel endpoint to connect to on acceptance
    pub url: String,
    /// Bearer credential for the channel endpoint
    pub authorization_token: String,
}

impl StreamRequest {
    /// Create a stream request.
    pub fn new(
        request_id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        authorization_token: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            name: name.into(),
            url: url.into(),
            authorization_token: authorization_token.into(),
        }
    }
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("request_id", &self.request_id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("authorization_token", &"<redacted>")
            .finish()
    }
}
