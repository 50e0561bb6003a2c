//! Connections.
//!
//! [`NetworkConnection`] is the one contract application code sees. It is
//! implemented by:
//!
//! - [`RemoteConnection`]: frames over a [`Link`](tether_transport::Link),
//!   driven by the manager actor
//! - [`LocalConnection`]: an in-process pair that calls the peer's handler
//!   directly with no encoding
//!
//! so application code never needs to know whether its peer lives in the
//! same process.

pub mod local;
pub mod remote;

pub use local::{LocalConnection, LocalPair};
pub use remote::RemoteConnection;

use crate::auth::User;
use crate::codec::Message;
use crate::error::Result;
use crate::manager::ManagerId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::Reliability;

/// Shared handle to any connection.
pub type ConnectionRef<M> = Arc<dyn NetworkConnection<M>>;

/// Operations common to local and remote connections.
#[async_trait]
pub trait NetworkConnection<M: Message>: Send + Sync {
    /// Manager-assigned ID, unique among live connections.
    fn id(&self) -> u32;

    /// Manager that owns this connection; `None` for a standalone local pair.
    fn manager(&self) -> Option<ManagerId>;

    /// Returns true for in-process connections.
    fn is_local(&self) -> bool;

    /// Returns true once the connect handshake completed and until close.
    fn is_connected(&self) -> bool;

    /// Returns true once traffic is encrypted.
    fn is_secure(&self) -> bool;

    /// Authenticated user, if any.
    fn user(&self) -> Option<User>;

    /// Application tag attached to this connection.
    fn profile(&self) -> Option<M>;

    /// Replace the application tag.
    fn set_profile(&self, profile: Option<M>);

    /// Send a fire-and-forget message.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`](crate::NetworkError::Closed) if the
    /// connection is not connected.
    fn send(&self, message: M, reliability: Reliability) -> Result<()>;

    /// Send a request and wait for the response. `None` uses the configured
    /// default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Timeout`](crate::NetworkError::Timeout),
    /// [`NetworkError::RequestRejected`](crate::NetworkError::RequestRejected)
    /// or [`NetworkError::Closed`](crate::NetworkError::Closed).
    async fn request(&self, message: M, timeout: Option<Duration>) -> Result<M>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}
