//! Transport encoding for binary images.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encode a binary payload as standard padded base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}
