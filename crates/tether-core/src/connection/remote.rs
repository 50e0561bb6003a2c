//! Connections over a transport link.
//!
//! A [`RemoteConnection`] is a [`Port`]: its pump task forwards inbound
//! frames to the manager actor and drains the connection's [`Sender`] onto
//! the link. All protocol state (handshake stage, pending requests, received
//! channels) lives in the actor; this type holds only what must be shared
//! with application threads, kept in atomics and once-cells.

use super::NetworkConnection;
use crate::auth::User;
use crate::codec::Message;
use crate::control::ControlMessage;
use crate::error::{NetworkError, Result};
use crate::format::{FormatSender, Outbound};
use crate::manager::ManagerId;
use crate::manager::command::{Command, Mailbox};
use crate::port::{self, Endpoint, Port};
use crate::sender::{Sender, SenderPump};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tether_crypto::Encryptor;
use tether_transport::{Link, Reliability};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

/// A connection carried by a [`Link`].
pub struct RemoteConnection<M: Message> {
    id: u32,
    outgoing: bool,
    port: Port,
    link: Arc<dyn Link>,
    sender: Sender,
    pump: Mutex<Option<SenderPump>>,
    format: Arc<FormatSender<M>>,
    encryptor: OnceLock<Arc<Encryptor>>,
    secure: AtomicBool,
    connected: AtomicBool,
    user: OnceLock<User>,
    profile: Mutex<Option<M>>,
    disconnect_sent: AtomicBool,
    linked: watch::Sender<bool>,
    manager: ManagerId,
    mailbox: Mailbox<M>,
    request_timeout: Duration,
}

impl<M: Message> RemoteConnection<M> {
    pub(crate) fn new(
        id: u32,
        outgoing: bool,
        link: Arc<dyn Link>,
        format: Arc<FormatSender<M>>,
        manager: ManagerId,
        mailbox: Mailbox<M>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (sender, pump) = Sender::channel();
        let (linked, _) = watch::channel(false);
        let direction = if outgoing { "out" } else { "in" };
        Arc::new(Self {
            id,
            outgoing,
            port: Port::new(format!("connection {id} ({direction} {})", link.peer())),
            link,
            sender,
            pump: Mutex::new(Some(pump)),
            format,
            encryptor: OnceLock::new(),
            secure: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            user: OnceLock::new(),
            profile: Mutex::new(None),
            disconnect_sent: AtomicBool::new(false),
            linked,
            manager,
            mailbox,
            request_timeout,
        })
    }

    /// Returns true if this side dialed the link.
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    /// Peer label from the link.
    pub fn peer(&self) -> String {
        self.link.peer()
    }

    /// Underlying link.
    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub(crate) fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Session encryptor, once the SRP exchange produced one.
    pub(crate) fn encryptor(&self) -> Option<&Encryptor> {
        self.encryptor.get().map(Arc::as_ref)
    }

    pub(crate) fn install_encryptor(&self, encryptor: Encryptor) -> Result<()> {
        debug!(connection = self.id, fingerprint = encryptor.fingerprint(), "session key installed");
        self.encryptor
            .set(Arc::new(encryptor))
            .map_err(|_| NetworkError::protocol("session already established"))
    }

    /// Encrypt everything from now on.
    pub(crate) fn mark_secure(&self, user: User) {
        let _ = self.user.set(user);
        self.secure.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Seal `outbound` (encrypted once secure) and queue it.
    pub(crate) fn send_outbound(&self, outbound: &Outbound) -> Result<()> {
        let encryptor = if self.is_secure() {
            Some(self.encryptor().ok_or(NetworkError::invalid_state("secure without session"))?)
        } else {
            None
        };
        let block = self.format.seal(outbound, encryptor)?;
        if self.sender.enqueue(block) {
            Ok(())
        } else {
            Err(NetworkError::Closed)
        }
    }

    pub(crate) fn send_control(&self, message: &ControlMessage<M>) -> Result<()> {
        trace!(connection = self.id, header = ?message.header(), "control frame");
        self.send_outbound(&self.format.control(message)?)
    }

    /// Send `Disconnect` once; later calls are no-ops.
    pub(crate) fn send_disconnect(&self, reason: Option<String>) -> Result<()> {
        if self.disconnect_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send_control(&ControlMessage::Disconnect { reason })
    }

    /// The peer said goodbye; do not answer with our own `Disconnect`.
    pub(crate) fn suppress_disconnect(&self) {
        self.disconnect_sent.store(true, Ordering::SeqCst);
    }

    pub(crate) fn respond(&self, request: u32, message: &M) -> Result<()> {
        let magnitude = i32::try_from(request)
            .map_err(|_| NetworkError::protocol("request id out of range"))?;
        self.send_outbound(&self.format.message(-magnitude, message, Reliability::Ordered)?)
    }

    pub(crate) fn reject(&self, request: u32, reason: String) -> Result<()> {
        self.send_control(&ControlMessage::RejectRequest { request, reason })
    }

    pub(crate) fn send_request(&self, request: u32, message: &M) -> Result<()> {
        let magnitude = i32::try_from(request)
            .map_err(|_| NetworkError::protocol("request id out of range"))?;
        self.send_outbound(&self.format.message(magnitude, message, Reliability::Ordered)?)
    }

    fn post(&self, command: Command<M>) -> Result<()> {
        self.mailbox.send(command).map_err(|_| NetworkError::Closed)
    }
}

#[async_trait]
impl<M: Message> Endpoint for RemoteConnection<M> {
    fn port(&self) -> &Port {
        &self.port
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut pump = self
            .pump
            .lock()
            .ok()
            .and_then(|mut pump| pump.take())
            .ok_or(NetworkError::invalid_state("connection pump already started"))?;

        let mut linked = self.linked.subscribe();
        tokio::select! {
            _ = port::stopped(&mut shutdown) => return Ok(()),
            ready = async { linked.wait_for(|linked| *linked).await.is_ok() } => {
                if !ready {
                    return Err(NetworkError::Closed);
                }
            }
        }

        let (received_tx, mut received) = mpsc::unbounded_channel();
        let link = Arc::clone(&self.link);
        let receive = link.run(received_tx);
        tokio::pin!(receive);

        loop {
            tokio::select! {
                biased;
                _ = port::stopped(&mut shutdown) => {
                    let flushed = pump.flush(self.link.as_ref()).await?;
                    trace!(connection = self.id, flushed, "pump stopped");
                    return Ok(());
                }
                result = &mut receive => {
                    while let Ok(bytes) = received.try_recv() {
                        self.post(Command::Frame { connection: self.id, bytes })?;
                    }
                    return Err(match result {
                        Ok(()) => NetworkError::Closed,
                        Err(err) => err.into(),
                    });
                }
                Some(bytes) = received.recv() => {
                    self.post(Command::Frame { connection: self.id, bytes })?;
                }
                Some(block) = pump.next() => {
                    SenderPump::write(self.link.as_ref(), block).await?;
                }
            }
        }
    }

    async fn link(&self) -> Result<()> {
        if self.outgoing {
            self.link.connect().await?;
        }
        self.linked.send_replace(true);
        Ok(())
    }

    async fn unlink(&self) -> Result<()> {
        if self.is_connected() {
            self.send_disconnect(None)?;
        }
        Ok(())
    }

    async fn release(&self) {
        if let Err(err) = self.link.close().await {
            debug!(connection = self.id, "link close failed: {}", err);
        }
        let connected = self.connected.swap(false, Ordering::SeqCst);
        let _ = self.mailbox.send(Command::Released {
            connection: self.id,
            error: self.port.error(),
            connected,
        });
    }
}

#[async_trait]
impl<M: Message> NetworkConnection<M> for RemoteConnection<M> {
    fn id(&self) -> u32 {
        self.id
    }

    fn manager(&self) -> Option<ManagerId> {
        Some(self.manager)
    }

    fn is_local(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }

    fn user(&self) -> Option<User> {
        self.user.get().cloned()
    }

    fn profile(&self) -> Option<M> {
        self.profile.lock().ok().and_then(|profile| profile.clone())
    }

    fn set_profile(&self, profile: Option<M>) {
        if let Ok(mut slot) = self.profile.lock() {
            *slot = profile;
        }
    }

    fn send(&self, message: M, reliability: Reliability) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::Closed);
        }
        self.send_outbound(&self.format.message(crate::BROADCAST, &message, reliability)?)
    }

    async fn request(&self, message: M, timeout: Option<Duration>) -> Result<M> {
        if !self.is_connected() {
            return Err(NetworkError::Closed);
        }
        let (reply, response) = oneshot::channel();
        let (registered_tx, registered) = oneshot::channel();
        self.post(Command::Request {
            connection: self.id,
            message,
            reply,
            registered: registered_tx,
        })?;
        let id = registered.await.map_err(|_| NetworkError::Closed)??;

        match tokio::time::timeout(timeout.unwrap_or(self.request_timeout), response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => {
                let _ = self.post(Command::ExpireRequest {
                    connection: self.id,
                    request: id,
                });
                Err(NetworkError::timeout("request timed out"))
            }
        }
    }

    async fn close(&self) {
        port::close(self).await;
    }
}

impl<M: Message> std::fmt::Debug for RemoteConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("id", &self.id)
            .field("outgoing", &self.outgoing)
            .field("peer", &self.link.peer())
            .field("connected", &self.is_connected())
            .field("secure", &self.is_secure())
            .finish()
    }
}
