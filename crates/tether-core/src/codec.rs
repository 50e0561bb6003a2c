//! Payload serializer contract.
//!
//! The networking layer never inspects application messages; it hands them
//! to a [`Codec`] to turn them into bytes and back.

use crate::error::{NetworkError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// Application message carried by connections and channels.
pub trait Message: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> Message for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// Message-to-bytes serializer.
pub trait Codec<M>: Send + Sync {
    /// Append the encoding of `message` to `out`.
    ///
    /// # Errors
    /// Returns [`NetworkError::Codec`] if the message cannot be encoded.
    fn encode(&self, message: &M, out: &mut Vec<u8>) -> Result<()>;

    /// Decode one message occupying all of `bytes`.
    ///
    /// # Errors
    /// Returns [`NetworkError::Codec`] for malformed input.
    fn decode(&self, bytes: &[u8]) -> Result<M>;
}

/// [`Codec`] for any serde type, using bincode.
pub struct BincodeCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> BincodeCodec<M> {
    /// Create the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for BincodeCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for BincodeCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<M> Codec<M> for BincodeCodec<M>
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, message).map_err(|e| NetworkError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M> {
        bincode::deserialize(bytes).map_err(|e| NetworkError::Codec(e.to_string()))
    }
}
