//! Wire message types for the forward and telemetry protocols.
//!
//! Every WebSocket binary message carries exactly one CBOR [`Envelope`].
//! On a forward stream the first hub→probe envelope must be `Dial` and the
//! first probe→hub envelope must be `DialResponse`; everything after a
//! successful dial is `Transfer` frames in both directions. On a telemetry
//! stream the subscriber sends one `Subscribe*` envelope and then receives
//! a stream of event envelopes.

use serde::{Deserialize, Serialize};

/// Numeric message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgType {
    Dial = 0x01,
    DialResponse = 0x02,
    Transfer = 0x03,

    SubscribeTransfer = 0x10,
    SubscribeConnection = 0x11,
    TransferEvent = 0x12,
    ConnectionEvent = 0x13,
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::Dial),
            0x02 => Ok(Self::DialResponse),
            0x03 => Ok(Self::Transfer),
            0x10 => Ok(Self::SubscribeTransfer),
            0x11 => Ok(Self::SubscribeConnection),
            0x12 => Ok(Self::TransferEvent),
            0x13 => Ok(Self::ConnectionEvent),
            _ => Err(format!("unknown message type: 0x{v:02x}")),
        }
    }
}

/// Result code of a dial attempt, sent in the first probe→hub envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum DialCode {
    /// Dial succeeded; transfer frames follow.
    Unspecified = 0,
    FailedToResolveHost = 1,
    HostUnreachable = 2,
}

impl From<DialCode> for u8 {
    fn from(c: DialCode) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for DialCode {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Unspecified),
            1 => Ok(Self::FailedToResolveHost),
            2 => Ok(Self::HostUnreachable),
            _ => Err(format!("unknown dial code: {v}")),
        }
    }
}

/// Envelope: every message has a `type` plus a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,

    #[serde(flatten)]
    pub payload: Payload,
}

/// All possible message payloads (untagged for CBOR compatibility).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Dial(DialPayload),
    DialResponse(DialResponsePayload),
    Transfer(TransferPayload),
    TransferEvent(TransferEventPayload),
    ConnectionEvent(ConnectionEventPayload),
    Empty(EmptyPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialPayload {
    /// Target `host:port` the probe should connect to.
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialResponsePayload {
    pub code: DialCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPayload {
    /// Opaque tunnel bytes. Empty payloads are valid and carry no data.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// One observed read/write batch. Timestamps are nanosecond Unix time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEventPayload {
    pub connection_id: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub bytes_count: u64,
}

/// Connection lifecycle record. `closed_at == 0` means "still open".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEventPayload {
    pub connection_id: String,
    pub client_address: String,
    pub target_address: String,
    pub opened_at: u64,
    pub closed_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyPayload {}

impl Envelope {
    pub fn dial(destination: impl Into<String>) -> Self {
        Self {
            msg_type: MsgType::Dial,
            payload: Payload::Dial(DialPayload {
                destination: destination.into(),
            }),
        }
    }

    pub fn dial_response(code: DialCode) -> Self {
        Self {
            msg_type: MsgType::DialResponse,
            payload: Payload::DialResponse(DialResponsePayload { code }),
        }
    }

    pub fn transfer(data: Vec<u8>) -> Self {
        Self {
            msg_type: MsgType::Transfer,
            payload: Payload::Transfer(TransferPayload { data }),
        }
    }

    pub fn subscribe_transfer() -> Self {
        Self {
            msg_type: MsgType::SubscribeTransfer,
            payload: Payload::Empty(EmptyPayload {}),
        }
    }

    pub fn subscribe_connection() -> Self {
        Self {
            msg_type: MsgType::SubscribeConnection,
            payload: Payload::Empty(EmptyPayload {}),
        }
    }

    /// Returns the transfer data when this is a `Transfer` envelope.
    pub fn into_transfer_data(self) -> Option<Vec<u8>> {
        match (self.msg_type, self.payload) {
            (MsgType::Transfer, Payload::Transfer(p)) => Some(p.data),
            _ => None,
        }
    }
}
