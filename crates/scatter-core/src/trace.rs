//! Request trace ids.
//!
//! A trace id is an opaque string minted at the hub's ingress, carried to
//! the probe in the `trace_id` upgrade-request header, and attached as a
//! span field to every log record emitted while handling the request.

use std::fmt;

use uuid::Uuid;

/// Metadata header carrying the trace id across the forward protocol.
pub const TRACE_ID_HEADER: &str = "trace_id";

/// Opaque request correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    /// Mints a fresh random trace id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TraceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TraceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
