//! Error types for the networking layer
//!
//! Errors are classified by what they do to the connection that raised them:
//!
//! - **Dropping**: protocol, transport and crypto failures close the connection
//! - **Local**: timeouts and request rejections fail one operation and leave
//!   the connection open
//! - **Expected**: cancellation and closed ports during intentional shutdown,
//!   never logged as errors
//!
//! # Example
//!
//! ```no_run
//! use tether_core::{NetworkError, Result};
//!
//! fn report(err: &NetworkError) {
//!     if err.is_expected() {
//!         return;
//!     }
//!     if err.drops_connection() {
//!         eprintln!("connection lost: {err}");
//!     } else {
//!         eprintln!("operation failed: {err}");
//!     }
//! }
//! ```

use std::borrow::Cow;
use tether_crypto::CryptoError;
use tether_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in networking operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    // ============ Connection-dropping Errors ============
    /// Malformed, unexpected or unexpectedly encrypted frame
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Handshake or verification failure; drops only the connecting attempt
    #[error("Authentication failed: {0}")]
    Authentication(Cow<'static, str>),

    /// Transport read/write failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============ Operation Errors ============
    /// The peer rejected a request or connect attempt
    #[error("Request rejected: {0}")]
    RequestRejected(Cow<'static, str>),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Payload codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    // ============ Lifecycle Errors ============
    /// Operation cancelled by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Port or connection already closed
    #[error("Connection closed")]
    Closed,

    /// Invalid state transition or call in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl NetworkError {
    /// Returns true for errors raised by intentional shutdown
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, NetworkError::Cancelled | NetworkError::Closed)
    }

    /// Returns true if this error must close the connection it occurred on
    #[must_use]
    pub fn drops_connection(&self) -> bool {
        matches!(
            self,
            NetworkError::Protocol(_)
                | NetworkError::Authentication(_)
                | NetworkError::Transport(_)
                | NetworkError::Crypto(_)
                | NetworkError::Codec(_)
        )
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        NetworkError::Protocol(Cow::Borrowed(context))
    }

    /// Create an authentication error with static context (zero allocation)
    #[must_use]
    pub const fn authentication(context: &'static str) -> Self {
        NetworkError::Authentication(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NetworkError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NetworkError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NetworkError::Transport(Cow::Borrowed(context))
    }

    /// Create a rejection with a peer-supplied reason
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        NetworkError::RequestRejected(Cow::Owned(reason.into()))
    }
}

impl From<TransportError> for NetworkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => NetworkError::Closed,
            other => NetworkError::Transport(Cow::Owned(other.to_string())),
        }
    }
}

impl From<CryptoError> for NetworkError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication(context) => NetworkError::authentication(context),
            CryptoError::InvalidMessage(context) => {
                NetworkError::Protocol(Cow::Owned(format!("malformed handshake data: {context}")))
            }
            other => NetworkError::Crypto(other.to_string()),
        }
    }
}

/// Result type for networking operations
pub type Result<T> = std::result::Result<T, NetworkError>;
