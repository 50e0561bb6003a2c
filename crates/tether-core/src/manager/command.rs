//! Actor mailbox protocol.
//!
//! Everything that touches a manager's registries arrives here as a
//! [`Command`]: pump tasks post frames and releases, handles post
//! application operations, and replies travel back on `oneshot` channels.

use crate::auth::Credentials;
use crate::codec::Message;
use crate::connection::{ConnectionRef, LocalPair, RemoteConnection};
use crate::error::{NetworkError, Result};
use crate::manager::host::Host;
use std::sync::Arc;
use tether_transport::{Link, Listener};
use tokio::sync::{mpsc, oneshot};

/// Sending half of a manager's mailbox.
pub type Mailbox<M> = mpsc::UnboundedSender<Command<M>>;

/// Reply slot for a pending client handshake.
pub type Handshake<M> = oneshot::Receiver<Result<Option<M>>>;

/// Channel operations posted by [`Channel`](crate::Channel) handles.
pub enum ChannelCommand<M> {
    /// Open a channel to a connection
    Attach {
        /// Channel ID
        channel: i32,
        /// Connection ID
        connection: u32,
    },
    /// Publish a value
    Update {
        /// Channel ID
        channel: i32,
        /// New value
        message: M,
    },
    /// Close a channel for one connection
    Detach {
        /// Channel ID
        channel: i32,
        /// Connection ID
        connection: u32,
    },
    /// Close a channel for everyone
    Close {
        /// Channel ID
        channel: i32,
    },
}

/// Messages processed by the manager actor.
pub enum Command<M: Message> {
    // ============ Transport events ============
    /// A host accepted a link
    Accepted {
        /// Accepting host
        host: u32,
        /// Inbound link
        link: Arc<dyn Link>,
    },
    /// Raw frame received on a connection
    Frame {
        /// Connection ID
        connection: u32,
        /// Frame bytes
        bytes: Vec<u8>,
    },
    /// A connection's port finished closing
    Released {
        /// Connection ID
        connection: u32,
        /// Error that dropped it, if any
        error: Option<NetworkError>,
        /// Whether it was connected when it closed
        connected: bool,
    },
    /// A host's port finished closing
    HostReleased {
        /// Host ID
        host: u32,
    },

    // ============ Application operations ============
    /// Register an outgoing connection
    Attach {
        /// Dialed link
        link: Arc<dyn Link>,
        /// Connect payload
        request: Option<M>,
        /// Optional SRP credentials
        credentials: Option<Credentials>,
        /// Registered connection and its handshake completion
        reply: oneshot::Sender<Result<(Arc<RemoteConnection<M>>, Handshake<M>)>>,
    },
    /// Send the first handshake frame of an opened outgoing connection
    Begin {
        /// Connection ID
        connection: u32,
    },
    /// Register and send a request
    Request {
        /// Connection ID
        connection: u32,
        /// Request payload
        message: M,
        /// Response slot
        reply: oneshot::Sender<Result<M>>,
        /// Assigned request ID
        registered: oneshot::Sender<Result<u32>>,
    },
    /// Forget a timed-out request and release its ID
    ExpireRequest {
        /// Connection ID
        connection: u32,
        /// Request ID
        request: u32,
    },
    /// Create an in-process pair
    ConnectLocal {
        /// Connect payload
        request: Option<M>,
        /// Created pair
        reply: oneshot::Sender<Result<LocalPair<M>>>,
    },
    /// List connected connections
    Connections {
        /// Snapshot
        reply: oneshot::Sender<Vec<ConnectionRef<M>>>,
    },
    /// Register a host
    AddHost {
        /// Listener to accept from
        listener: Arc<dyn Listener>,
        /// Registered host
        reply: oneshot::Sender<Arc<Host<M>>>,
    },
    /// Look up a host for closing
    CloseHost {
        /// Host ID
        host: u32,
        /// The host, if it exists
        reply: oneshot::Sender<Option<Arc<Host<M>>>>,
    },
    /// Create a channel
    OpenChannel {
        /// Profile announced to peers
        profile: Option<M>,
        /// Channel ID
        reply: oneshot::Sender<i32>,
    },
    /// Channel operation
    Channel(ChannelCommand<M>),
    /// Hand over everything that must be closed
    Shutdown {
        /// Hosts and connections to close
        reply: oneshot::Sender<(Vec<Arc<Host<M>>>, Vec<ConnectionRef<M>>)>,
    },
    /// Stop the actor loop
    Stop,
}
