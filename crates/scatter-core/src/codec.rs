//! CBOR codec for protocol envelopes.
//!
//! WebSocket messages are already delimited, so frames carry bare CBOR
//! with no length prefix. Decoding rejects frames above [`MAX_FRAME_SIZE`].

use crate::error::{Error, Result};

/// Maximum accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value into CBOR bytes.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode CBOR bytes into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let value: T = ciborium::from_reader(data)?;
    Ok(value)
}
