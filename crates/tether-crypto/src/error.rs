//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// SRP verification failed (wrong secret, forged proof or degenerate ephemeral)
    #[error("authentication failed: {0}")]
    Authentication(&'static str),

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure or truncated input)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

impl CryptoError {
    /// Returns true if this error means the peer failed to prove knowledge of the secret
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(self, CryptoError::Authentication(_))
    }
}

impl From<bincode::Error> for CryptoError {
    fn from(err: bincode::Error) -> Self {
        CryptoError::InvalidMessage(err.to_string())
    }
}
