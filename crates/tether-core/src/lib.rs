//! # Tether Core
//!
//! Transport-agnostic networking layer: connections with an optional
//! SRP-authenticated, AES-encrypted session, request/response RPC, and
//! replicated state channels.
//!
//! This crate provides:
//! - Port lifecycle shared by hosts and connections
//! - Frame encoding and decoding (varint headers, optional per-frame encryption)
//! - Local (in-process) and remote connections with the connect handshake
//! - Channels with per-connection acknowledgement and resend
//! - ID tracking with delayed reuse, pooled send blocks
//! - The [`Manager`] that composes all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Manager (actor task)                         │
//! │   connections, pending requests, hosts, owned channels          │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │   Host pumps (accept)        │   Connection pumps (recv / send) │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │          Format (header varint, control frames, AES-GCM)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Transport (Link / Listener: memory, TCP, ...)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod auth;
pub mod block;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod format;
pub mod handler;
pub mod id;
pub mod manager;
pub mod port;
pub mod sender;
pub mod wire;

pub use auth::{Credentials, MemoryUserDirectory, User, UserDirectory, UserRecord};
pub use channel::Channel;
pub use codec::{BincodeCodec, Codec, Message};
pub use config::{
    AuthenticationPolicy, ChannelConfig, ConnectionConfig, NetworkConfig, PoolConfig,
};
pub use connection::{ConnectionRef, LocalConnection, LocalPair, NetworkConnection};
pub use control::ControlMessage;
pub use error::{NetworkError, Result};
pub use format::{FormatReceiver, FormatSender, Frame};
pub use handler::{Handler, NullHandler, Responder};
pub use manager::{HostId, Manager, ManagerId};
pub use tether_transport::Reliability;

/// Request magnitude reserved for broadcast messages
pub const BROADCAST: i32 = 0;
