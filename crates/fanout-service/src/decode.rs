use serde::de::DeserializeOwned;

use crate::error::DecodeError;

/// Decodes a JSON payload.
///
/// An empty payload is decoded as JSON `null`, so requests without a response body can be
/// decoded into `()` or an `Option`.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_slice(b"null").map_err(DecodeError::from);
    }
    serde_json::from_slice(payload).map_err(DecodeError::from)
}
