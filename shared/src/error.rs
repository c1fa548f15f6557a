//! Error types for envelope and frame handling

use thiserror::Error;

/// Errors that can occur while encoding or decoding relay envelopes
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Invalid or unparsable key material (master key, PEM keys)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// AES-GCM encryption/decryption failure
    #[error("Encryption error: {0}")]
    EncryptionError(String),

    /// RSA signature did not verify against the configured peer key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Frame does not have the `{from, cipher, sig}` envelope shape
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

/// Result type alias for relay codec operations
pub type Result<T> = std::result::Result<T, RelayError>;
