//! Device connection string parsing.
//!
//! Format: semicolon-separated `Key=Value` pairs, e.g.
//!
//! ```text
//! HostName=hub.example.net;DeviceId=sensor-01;SharedAccessKey=c2VjcmV0
//! ```
//!
//! Keys are matched case-insensitively. Values are split on the first `=`
//! only, so base64 keys with padding survive intact.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Result, StreamError};

/// Device authentication material.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Symmetric key, optionally scoped to a named policy.
    SharedAccessKey {
        /// Base64 key material.
        key: String,
        /// Access policy name (`SharedAccessKeyName`).
        key_name: Option<String>,
    },
    /// Pre-computed shared access signature.
    SharedAccessSignature(String),
    /// Client certificate authentication (`x509=true`).
    X509,
}

impl Credential {
    /// Get the credential kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SharedAccessKey { .. } => "shared_access_key",
            Self::SharedAccessSignature(_) => "shared_access_signature",
            Self::X509 => "x509",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedAccessKey { key_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("key", &"<redacted>")
                .field("key_name", key_name)
                .finish(),
            Self::SharedAccessSignature(_) => f.write_str("SharedAccessSignature(<redacted>)"),
            Self::X509 => f.write_str("X509"),
        }
    }
}

/// Parsed device connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Broker host name.
    pub host_name: String,
    /// Device identity.
    pub device_id: String,
    /// Module identity, for module-scoped connections.
    pub module_id: Option<String>,
    /// Edge gateway to route through.
    pub gateway_host_name: Option<String>,
    /// Authentication material.
    pub credential: Credential,
}

/// Redacted, serializable view of a connection string.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    /// Broker host name.
    pub host_name: String,
    /// Device identity.
    pub device_id: String,
    /// Module identity.
    pub module_id: Option<String>,
    /// Edge gateway.
    pub gateway_host_name: Option<String>,
    /// Credential kind.
    pub credential: &'static str,
}

impl ConnectionString {
    /// Render the connection string with secrets masked.
    pub fn redacted(&self) -> String {
        let mut out = format!("HostName={};DeviceId={}", self.host_name, self.device_id);
        if let Some(module_id) = &self.module_id {
            out.push_str(&format!(";ModuleId={module_id}"));
        }
        if let Some(gateway) = &self.gateway_host_name {
            out.push_str(&format!(";GatewayHostName={gateway}"));
        }
        match &self.credential {
            Credential::SharedAccessKey { key_name, .. } => {
                if let Some(name) = key_name {
                    out.push_str(&format!(";SharedAccessKeyName={name}"));
                }
                out.push_str(";SharedAccessKey=***");
            },
            Credential::SharedAccessSignature(_) => out.push_str(";SharedAccessSignature=***"),
            Credential::X509 => out.push_str(";x509=true"),
        }
        out
    }

    /// Serializable summary without secrets.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            host_name: self.host_name.clone(),
            device_id: self.device_id.clone(),
            module_id: self.module_id.clone(),
            gateway_host_name: self.gateway_host_name.clone(),
            credential: self.credential.kind(),
        }
    }
}

#[derive(Default)]
struct Fields {
    host_name: Option<String>,
    device_id: Option<String>,
    module_id: Option<String>,
    gateway_host_name: Option<String>,
    key: Option<String>,
    key_name: Option<String>,
    signature: Option<String>,
    x509: Option<String>,
}

fn set_once(slot: &mut Option<String>, key: &str, value: &str) -> Result<()> {
    if slot.is_some() {
        return Err(StreamError::ConnectionString(format!("Duplicate key: {key}")));
    }
    *slot = Some(value.to_string());
    Ok(())
}

impl FromStr for ConnectionString {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = Fields::default();

        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                StreamError::ConnectionString(format!("Segment without '=': {segment}"))
            })?;
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() {
                return Err(StreamError::ConnectionString(format!("Empty value for {key}")));
            }

            let slot = match key.to_ascii_lowercase().as_str() {
                "hostname" => &mut fields.host_name,
                "deviceid" => &mut fields.device_id,
                "moduleid" => &mut fields.module_id,
                "gatewayhostname" => &mut fields.gateway_host_name,
                "sharedaccesskey" => &mut fields.key,
                "sharedaccesskeyname" => &mut fields.key_name,
                "sharedaccesssignature" => &mut fields.signature,
                "x509" => &mut fields.x509,
                _ => {
                    return Err(StreamError::ConnectionString(format!("Unknown key: {key}")));
                },
            };
            set_once(slot, key, value)?;
        }

        let host_name = fields
            .host_name
            .ok_or_else(|| StreamError::ConnectionString("Missing HostName".to_string()))?;
        let device_id = fields
            .device_id
            .ok_or_else(|| StreamError::ConnectionString("Missing DeviceId".to_string()))?;

        let x509 = match fields.x509.as_deref() {
            None => false,
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            Some(v) => {
                return Err(StreamError::ConnectionString(format!(
                    "x509 must be true or false, got {v}"
                )));
            },
        };

        let has_key_name = fields.key_name.is_some();
        let credential = match (fields.key, fields.signature, x509) {
            (Some(key), None, false) => Credential::SharedAccessKey {
                key,
                key_name: fields.key_name,
            },
            (None, Some(signature), false) => Credential::SharedAccessSignature(signature),
            (None, None, true) => Credential::X509,
            (None, None, false) => {
                return Err(StreamError::ConnectionString(
                    "Missing credential (SharedAccessKey, SharedAccessSignature or x509=true)"
                        .to_string(),
                ));
            },
            _ => {
                return Err(StreamError::ConnectionString(
                    "Exactly one credential may be given".to_string(),
                ));
            },
        };

        if has_key_name && !matches!(credential, Credential::SharedAccessKey { .. }) {
            return Err(StreamError::ConnectionString(
                "SharedAccessKeyName requires SharedAccessKey".to_string(),
            ));
        }

        Ok(Self {
            host_name,
            device_id,
            module_id: fields.module_id,
            gateway_host_name: fields.gateway_host_name,
            credential,
        })
    }
}
