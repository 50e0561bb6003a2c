//! # Tether Crypto
//!
//! Cryptographic primitives for the Tether networking layer.
//!
//! This crate provides:
//! - SRP-6a zero-knowledge mutual authentication (no secret crosses the wire)
//! - AES-256-GCM session encryption with a fresh random nonce per message
//! - The [`Authenticator`] surface used by connections during the handshake
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Password authentication | SRP-6a, RFC 5054 2048-bit group | 112-bit |
//! | Hash | SHA-256 | 128-bit collision |
//! | Session encryption | AES-256-GCM | 256-bit key |
//!
//! ## Handshake
//!
//! ```text
//! Client                                   Server
//!   | create_verifier(I, P) -- registration --> stores (salt, v)
//!   |                                         |
//!   |                      create_session(I, v) -> (salt, B)
//!   | <-------------- session data ---------- |
//!   | create_encryptor(data, I, P) -> (A, M1) |
//!   | ---------------- response ------------> |
//!   |                 session.create_encryptor(A, M1) -> K
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod authenticator;
pub mod encryptor;
pub mod error;
pub mod random;
pub mod srp;

pub use authenticator::{Authenticator, ServerSession};
pub use encryptor::Encryptor;
pub use error::CryptoError;

/// AES-256-GCM key size
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size, prepended to every ciphertext
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Salt size used when creating verifiers
pub const SALT_SIZE: usize = 16;

/// Size of SRP ephemeral secrets in bytes
pub const EPHEMERAL_SECRET_SIZE: usize = 32;
