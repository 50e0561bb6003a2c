//! # Tether Transport
//!
//! Transport contracts for the Tether networking layer.
//!
//! This crate provides:
//! - The [`Link`] and [`Listener`] traits every backend implements
//! - [`Reliability`] delivery constraints attached to each frame
//! - An in-process transport ([`memory`]) for tests and same-process peers
//! - A length-prefixed TCP transport ([`tcp`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod tcp;
pub mod transport;

pub use memory::{MemoryLink, MemoryListener, MemoryNetwork};
pub use tcp::{TcpHost, TcpLink};
pub use transport::{
    Link, LinkCounters, Listener, Reliability, TransportError, TransportResult, TransportStats,
};
