//! In-process connection pairs.

use super::{ConnectionRef, NetworkConnection};
use crate::auth::User;
use crate::codec::Message;
use crate::error::{NetworkError, Result};
use crate::handler::{Handler, Responder};
use crate::manager::ManagerId;
use crate::manager::command::{Command, Mailbox};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tether_transport::Reliability;
use tokio::sync::oneshot;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Both ends of a local connection plus the server's connect response.
pub struct LocalPair<M: Message> {
    /// The end that initiated the connection
    pub outgoing: Arc<LocalConnection<M>>,
    /// The accepting end
    pub incoming: Arc<LocalConnection<M>>,
    /// Value returned by the incoming handler's `on_connection`
    pub response: Option<M>,
}

/// One end of an in-process connection.
///
/// Messages and requests invoke the peer end's handler directly on the
/// caller's task.
pub struct LocalConnection<M: Message> {
    id: u32,
    this: Weak<Self>,
    peer: OnceLock<Weak<Self>>,
    handler: Arc<dyn Handler<M>>,
    connected: AtomicBool,
    closed: AtomicBool,
    profile: Mutex<Option<M>>,
    requests: AtomicU32,
    request_timeout: Duration,
    manager: Option<ManagerId>,
    mailbox: Option<Mailbox<M>>,
}

impl<M: Message> LocalConnection<M> {
    /// Connect two handlers in-process. `incoming.on_connection` runs before
    /// this returns; on acceptance both ends fire `on_connected`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::RequestRejected`] if the incoming handler
    /// refuses the connection.
    pub fn connect(
        ids: (u32, u32),
        outgoing: Arc<dyn Handler<M>>,
        incoming: Arc<dyn Handler<M>>,
        request: Option<M>,
    ) -> Result<LocalPair<M>> {
        Self::connect_with(ids, outgoing, incoming, request, DEFAULT_REQUEST_TIMEOUT, None)
    }

    pub(crate) fn connect_with(
        ids: (u32, u32),
        outgoing: Arc<dyn Handler<M>>,
        incoming: Arc<dyn Handler<M>>,
        request: Option<M>,
        request_timeout: Duration,
        owner: Option<(ManagerId, Mailbox<M>)>,
    ) -> Result<LocalPair<M>> {
        let outgoing = Self::new(ids.0, outgoing, request_timeout, owner.clone());
        let incoming = Self::new(ids.1, incoming, request_timeout, owner);
        let _ = outgoing.peer.set(Arc::downgrade(&incoming));
        let _ = incoming.peer.set(Arc::downgrade(&outgoing));

        let incoming_ref: ConnectionRef<M> = incoming.clone();
        let outgoing_ref: ConnectionRef<M> = outgoing.clone();

        let response = incoming
            .handler
            .on_connection(&incoming_ref, request.as_ref())
            .map_err(NetworkError::rejected)?;

        outgoing.connected.store(true, Ordering::SeqCst);
        incoming.connected.store(true, Ordering::SeqCst);
        debug!(outgoing = ids.0, incoming = ids.1, "local pair connected");

        incoming.handler.on_connected(&incoming_ref, request.as_ref());
        outgoing.handler.on_connected(&outgoing_ref, response.as_ref());

        Ok(LocalPair {
            outgoing,
            incoming,
            response,
        })
    }

    fn new(
        id: u32,
        handler: Arc<dyn Handler<M>>,
        request_timeout: Duration,
        owner: Option<(ManagerId, Mailbox<M>)>,
    ) -> Arc<Self> {
        let (manager, mailbox) = owner.unzip();
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            peer: OnceLock::new(),
            handler,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            profile: Mutex::new(None),
            requests: AtomicU32::new(0),
            request_timeout,
            manager,
            mailbox,
        })
    }

    /// The other end, while it is alive.
    pub fn peer(&self) -> Option<Arc<Self>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn handle(&self) -> Option<ConnectionRef<M>> {
        self.this.upgrade().map(|this| this as ConnectionRef<M>)
    }

    /// Connected peer and its handle, or `Closed`.
    fn connected_peer(&self) -> Result<(Arc<Self>, ConnectionRef<M>)> {
        if !self.is_connected() {
            return Err(NetworkError::Closed);
        }
        let peer = self.peer().ok_or(NetworkError::Closed)?;
        let handle = peer.handle().ok_or(NetworkError::Closed)?;
        Ok((peer, handle))
    }

    pub(crate) fn deliver_channel_opened(&self, channel: i32, profile: Option<M>) {
        if let Ok((peer, handle)) = self.connected_peer() {
            peer.handler.on_channel_opened(&handle, channel, profile);
        }
    }

    pub(crate) fn deliver_channel_update(&self, channel: i32, message: M) {
        if let Ok((peer, handle)) = self.connected_peer() {
            peer.handler.on_channel_update(&handle, channel, message);
        }
    }

    pub(crate) fn deliver_channel_closed(&self, channel: i32) {
        if let Ok((peer, handle)) = self.connected_peer() {
            peer.handler.on_channel_closed(&handle, channel);
        }
    }

    /// Close this end only. Returns false if it was already closed.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            if let Some(handle) = self.handle() {
                self.handler.on_disconnected(&handle, None);
            }
        }
        if let Some(mailbox) = &self.mailbox {
            let _ = mailbox.send(Command::Released {
                connection: self.id,
                error: None,
                connected: was_connected,
            });
        }
        true
    }

    /// Close both ends synchronously.
    pub fn close_now(&self) {
        if self.shut() {
            debug!(connection = self.id, "local connection closed");
            if let Some(peer) = self.peer() {
                peer.shut();
            }
        }
    }
}

#[async_trait]
impl<M: Message> NetworkConnection<M> for LocalConnection<M> {
    fn id(&self) -> u32 {
        self.id
    }

    fn manager(&self) -> Option<ManagerId> {
        self.manager
    }

    fn is_local(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_secure(&self) -> bool {
        // Nothing leaves the process
        true
    }

    fn user(&self) -> Option<User> {
        None
    }

    fn profile(&self) -> Option<M> {
        self.profile.lock().ok().and_then(|profile| profile.clone())
    }

    fn set_profile(&self, profile: Option<M>) {
        if let Ok(mut slot) = self.profile.lock() {
            *slot = profile;
        }
    }

    fn send(&self, message: M, _reliability: Reliability) -> Result<()> {
        let (peer, handle) = self.connected_peer()?;
        peer.handler.on_received(&handle, message);
        Ok(())
    }

    async fn request(&self, message: M, timeout: Option<Duration>) -> Result<M> {
        let (peer, handle) = self.connected_peer()?;
        let id = self.requests.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let (reply, response) = oneshot::channel();
        peer.handler
            .on_request(&handle, message, Responder::local(id, reply));

        match tokio::time::timeout(timeout.unwrap_or(self.request_timeout), response).await {
            Ok(Ok(Ok(message))) => Ok(message),
            Ok(Ok(Err(reason))) => Err(NetworkError::rejected(reason)),
            Ok(Err(_)) => Err(NetworkError::rejected("request dropped")),
            Err(_) => Err(NetworkError::timeout("request timed out")),
        }
    }

    async fn close(&self) {
        self.close_now();
    }
}

impl<M: Message> std::fmt::Debug for LocalConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        reject: Option<String>,
        hold: Mutex<Vec<Responder<String>>>,
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Handler<String> for Recorder {
        fn on_connection(
            &self,
            _connection: &ConnectionRef<String>,
            request: Option<&String>,
        ) -> std::result::Result<Option<String>, String> {
            if let Some(reason) = &self.reject {
                return Err(reason.clone());
            }
            Ok(request.map(|r| format!("re:{r}")))
        }

        fn on_connected(&self, connection: &ConnectionRef<String>, message: Option<&String>) {
            self.push(format!("connected {} {:?}", connection.id(), message));
        }

        fn on_disconnected(&self, connection: &ConnectionRef<String>, _error: Option<&NetworkError>) {
            self.push(format!("disconnected {}", connection.id()));
        }

        fn on_received(&self, connection: &ConnectionRef<String>, message: String) {
            self.push(format!("received {} {}", connection.id(), message));
        }

        fn on_request(&self, _connection: &ConnectionRef<String>, message: String, responder: Responder<String>) {
            match message.as_str() {
                "hold" => self.hold.lock().unwrap().push(responder),
                "deny" => {
                    let _ = responder.reject("denied");
                }
                _ => {
                    let _ = responder.respond(message.to_uppercase());
                }
            }
        }
    }

    fn pair(server: Arc<Recorder>) -> (Arc<Recorder>, LocalPair<String>) {
        let client = Arc::new(Recorder::default());
        let pair = LocalConnection::connect((1, 2), client.clone(), server, Some("hi".into())).unwrap();
        (client, pair)
    }

    #[test]
    fn test_connect_fires_both_sides() {
        let server = Arc::new(Recorder::default());
        let (client, pair) = pair(server.clone());
        assert_eq!(pair.response.as_deref(), Some("re:hi"));
        assert!(pair.outgoing.is_connected());
        assert!(pair.incoming.is_connected());
        assert_eq!(server.events(), vec!["connected 2 Some(\"hi\")"]);
        assert_eq!(client.events(), vec!["connected 1 Some(\"re:hi\")"]);
    }

    #[test]
    fn test_send_is_synchronous() {
        let server = Arc::new(Recorder::default());
        let (_client, pair) = pair(server.clone());
        pair.outgoing.send("x".into(), Reliability::Unreliable).unwrap();
        assert_eq!(server.events().last().unwrap(), "received 2 x");
    }

    #[test]
    fn test_rejected_connect() {
        let server = Arc::new(Recorder {
            reject: Some("full".into()),
            ..Recorder::default()
        });
        let client = Arc::new(Recorder::default());
        let result = LocalConnection::<String>::connect((1, 2), client.clone(), server, None);
        assert_eq!(result.err(), Some(NetworkError::rejected("full")));
        assert!(client.events().is_empty());
    }

    #[tokio::test]
    async fn test_request_paths() {
        let server = Arc::new(Recorder::default());
        let (_client, pair) = pair(server.clone());
        assert_eq!(pair.outgoing.request("ping".into(), None).await.unwrap(), "PING");
        assert_eq!(
            pair.outgoing.request("deny".into(), None).await,
            Err(NetworkError::rejected("denied"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let server = Arc::new(Recorder::default());
        let (_client, pair) = pair(server.clone());
        let result = pair
            .outgoing
            .request("hold".into(), Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(NetworkError::Timeout(_))));
        assert_eq!(server.hold.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_closes_both_ends() {
        let server = Arc::new(Recorder::default());
        let (client, pair) = pair(server.clone());
        pair.incoming.close().await;
        assert!(!pair.outgoing.is_connected());
        assert!(!pair.incoming.is_connected());
        assert_eq!(client.events().last().unwrap(), "disconnected 1");
        assert_eq!(server.events().last().unwrap(), "disconnected 2");
        assert_eq!(
            pair.outgoing.send("late".into(), Reliability::Ordered),
            Err(NetworkError::Closed)
        );
    }
}
