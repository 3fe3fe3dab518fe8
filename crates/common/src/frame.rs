//! Upstream wire frame model.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream event names with protocol-level meaning. Everything else is
/// dispatched by the session's frame handler.
pub mod events {
    pub const AUTHENTICATED: &str = "authenticated";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const TIME_SYNC: &str = "timeSync";
}

/// A single JSON frame on the upstream WebSocket.
///
/// Every frame carries a `name`; the rest varies per event. Unknown input
/// fields are ignored and absent fields are skipped on output, so frames
/// survive being parsed and re-sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamFrame {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_time: Option<u64>,
}

impl UpstreamFrame {
    /// Frame with a name and a message body.
    pub fn named(name: impl Into<String>, msg: Value) -> Self {
        Self {
            name: name.into(),
            msg: Some(msg),
            version: None,
            request_id: None,
            local_time: None,
        }
    }

    /// Frame with only a name (keep-alive frames).
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            msg: None,
            version: None,
            request_id: None,
            local_time: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_local_time(mut self, local_time: u64) -> Self {
        self.local_time = Some(local_time);
        self
    }

    /// Payload used when forwarding this frame downstream: the `msg` body
    /// when present, otherwise the whole frame.
    pub fn payload(&self) -> Value {
        match &self.msg {
            Some(msg) => msg.clone(),
            None => serde_json::to_value(self).unwrap_or(Value::Null),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
