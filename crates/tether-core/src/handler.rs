//! Application callbacks.
//!
//! A [`Handler`] receives every connection, message, request and channel
//! event for one manager. All callbacks are synchronous and run on the
//! manager's actor task (or, for local pairs, on the caller's task), so
//! they must not block. Long work should be spawned.

use crate::codec::Message;
use crate::connection::ConnectionRef;
use crate::connection::remote::RemoteConnection;
use crate::error::{NetworkError, Result};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Application event sink.
#[allow(unused_variables)]
pub trait Handler<M: Message>: Send + Sync + 'static {
    /// Decide whether to accept an inbound connection.
    ///
    /// `Ok(response)` accepts and sends `response` back to the client;
    /// `Err(reason)` rejects and disconnects with `reason`.
    fn on_connection(
        &self,
        connection: &ConnectionRef<M>,
        request: Option<&M>,
    ) -> std::result::Result<Option<M>, String> {
        Ok(None)
    }

    /// The connection completed its handshake. Servers receive the client's
    /// request, clients the server's response.
    fn on_connected(&self, connection: &ConnectionRef<M>, message: Option<&M>) {}

    /// A connected connection closed. `error` is `None` for graceful closes.
    fn on_disconnected(&self, connection: &ConnectionRef<M>, error: Option<&NetworkError>) {}

    /// Fire-and-forget message from the peer.
    fn on_received(&self, connection: &ConnectionRef<M>, message: M) {}

    /// Request from the peer. The default rejects it.
    fn on_request(&self, connection: &ConnectionRef<M>, message: M, responder: Responder<M>) {
        let _ = responder.reject("no request handler");
    }

    /// The peer opened one of its channels to us.
    fn on_channel_opened(&self, connection: &ConnectionRef<M>, channel: i32, profile: Option<M>) {}

    /// New value on a channel the peer opened.
    fn on_channel_update(&self, connection: &ConnectionRef<M>, channel: i32, message: M) {}

    /// The peer closed one of its channels.
    fn on_channel_closed(&self, connection: &ConnectionRef<M>, channel: i32) {}
}

/// Handler that accepts every connection and ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl<M: Message> Handler<M> for NullHandler {}

enum Target<M: Message> {
    Remote(Arc<RemoteConnection<M>>),
    Local(oneshot::Sender<std::result::Result<M, String>>),
}

/// Completes one request, now or later.
///
/// Dropping a remote responder sends nothing, so the requester times out.
/// Dropping a local responder fails the request immediately.
pub struct Responder<M: Message> {
    request: u32,
    target: Target<M>,
}

impl<M: Message> Responder<M> {
    pub(crate) fn remote(connection: Arc<RemoteConnection<M>>, request: u32) -> Self {
        Self {
            request,
            target: Target::Remote(connection),
        }
    }

    pub(crate) fn local(request: u32, reply: oneshot::Sender<std::result::Result<M, String>>) -> Self {
        Self {
            request,
            target: Target::Local(reply),
        }
    }

    /// Request ID in the requester's ID space.
    pub fn request_id(&self) -> u32 {
        self.request
    }

    /// Answer the request.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] if the requester is gone.
    pub fn respond(self, message: M) -> Result<()> {
        match self.target {
            Target::Remote(connection) => connection.respond(self.request, &message),
            Target::Local(reply) => reply.send(Ok(message)).map_err(|_| NetworkError::Closed),
        }
    }

    /// Reject the request; the requester fails with
    /// [`NetworkError::RequestRejected`].
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] if the requester is gone.
    pub fn reject(self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        match self.target {
            Target::Remote(connection) => connection.reject(self.request, reason),
            Target::Local(reply) => reply.send(Err(reason)).map_err(|_| NetworkError::Closed),
        }
    }
}

impl<M: Message> std::fmt::Debug for Responder<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.target {
            Target::Remote(_) => "remote",
            Target::Local(_) => "local",
        };
        f.debug_struct("Responder")
            .field("request", &self.request)
            .field("target", &kind)
            .finish()
    }
}
