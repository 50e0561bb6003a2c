//! Link and Listener contracts shared by every transport backend.
//!
//! The networking layer never touches sockets directly. A [`Link`] moves
//! whole frames between two peers and a [`Listener`] produces links for
//! inbound peers. Anything that satisfies these two traits (TCP, a UDP
//! library, an in-process pipe) can carry Tether traffic.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Frame exceeds the transport's maximum frame size
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Offending frame size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Delivery guarantee requested for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// May be dropped or reordered
    Unreliable,
    /// Delivered, in any order
    Reliable,
    /// Delivered in send order
    #[default]
    Ordered,
}

impl Reliability {
    /// Returns true if the frame must eventually arrive
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        !matches!(self, Reliability::Unreliable)
    }
}

/// A bidirectional frame pipe to one peer.
///
/// `run` is the receive pump: it forwards every inbound frame to
/// `received` until the link is closed locally (`Ok`) or fails or is
/// dropped by the peer (`Err`).
#[async_trait]
pub trait Link: Send + Sync {
    /// Establish the link. Accepted links are already connected and return `Ok` immediately.
    ///
    /// # Errors
    /// Returns `TransportError` if the peer cannot be reached
    async fn connect(&self) -> TransportResult<()>;

    /// Send one frame.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after `close`, or the backend's failure
    async fn send(&self, frame: &[u8], reliability: Reliability) -> TransportResult<()>;

    /// Receive pump; see the trait docs.
    ///
    /// # Errors
    /// Returns `TransportError` when the link drops
    async fn run(&self, received: mpsc::UnboundedSender<Vec<u8>>) -> TransportResult<()>;

    /// Close the link and release resources. Idempotent.
    ///
    /// # Errors
    /// Returns `TransportError` if the backend fails to shut down cleanly
    async fn close(&self) -> TransportResult<()>;

    /// Human-readable peer label for logs.
    fn peer(&self) -> String;

    /// Check if the link is closed.
    fn is_closed(&self) -> bool;

    /// Get link statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Produces a [`Link`] for every inbound peer.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Start listening.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address is unavailable
    async fn bind(&self) -> TransportResult<()>;

    /// Wait for the next inbound peer.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the listener is closed
    async fn accept(&self) -> TransportResult<Arc<dyn Link>>;

    /// Stop listening. Idempotent.
    ///
    /// # Errors
    /// Returns `TransportError` if the backend fails to shut down cleanly
    async fn close(&self) -> TransportResult<()>;

    /// Human-readable local label for logs.
    fn local_label(&self) -> String;
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total frames sent
    pub frames_sent: u64,
    /// Total frames received
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters backing [`TransportStats`] for links shared across tasks.
#[derive(Debug, Default)]
pub struct LinkCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl LinkCounters {
    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}
