//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Key material was missing or malformed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// An encrypted operation was attempted before the engine was configured.
    #[error("crypto engine not configured")]
    NotConfigured,

    /// The peer did not echo our challenge back.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// The underlying primitives failed their known-answer check.
    #[error("crypto self-test failed")]
    SelfTestFailed,

    // Envelope errors
    /// A message was well-formed JSON but not a valid envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        ProtocolError::InvalidKey(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_error_display() {
        let err = ProtocolError::Decryption("bad padding".to_string());
        assert_eq!(err.to_string(), "decryption failed: bad padding");
    }

    #[test]
    fn test_invalid_key_error_display() {
        let err = ProtocolError::InvalidKey("expected 32 bytes".to_string());
        assert_eq!(err.to_string(), "invalid key material: expected 32 bytes");
    }

    #[test]
    fn test_challenge_mismatch_display() {
        assert_eq!(
            ProtocolError::ChallengeMismatch.to_string(),
            "challenge mismatch"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_hex_error() {
        let hex_err = hex::decode("zz").unwrap_err();
        let protocol_err: ProtocolError = hex_err.into();
        assert!(matches!(protocol_err, ProtocolError::InvalidKey(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
