//! Manager - composition root for hosts, connections and channels
//!
//! A [`Manager`] owns one actor task holding every registry. Hosts and
//! connections run their own pump tasks and report to the actor through its
//! mailbox, so no registry is ever shared behind a lock.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_core::{BincodeCodec, Manager, NetworkConfig, NullHandler};
//! use tether_transport::MemoryNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let server = Manager::<String>::new(
//!         NetworkConfig::default(),
//!         Arc::new(BincodeCodec::<String>::new()),
//!         Arc::new(NullHandler),
//!     )?;
//!     server.host(Arc::new(network.listener("server"))).await?;
//!
//!     let client = Manager::<String>::new(
//!         NetworkConfig::default(),
//!         Arc::new(BincodeCodec::<String>::new()),
//!         Arc::new(NullHandler),
//!     )?;
//!     let (connection, _) = client
//!         .connect(network.dial("server", "client")?, None, None)
//!         .await?;
//!     connection.close().await;
//!
//!     client.shutdown().await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

mod actor;
pub mod command;
pub mod host;

pub use host::{Host, HostId};

use crate::auth::{Credentials, MemoryUserDirectory, UserDirectory};
use crate::channel::Channel;
use crate::codec::{Codec, Message};
use crate::config::NetworkConfig;
use crate::connection::{ConnectionRef, LocalPair, NetworkConnection};
use crate::error::{NetworkError, Result};
use crate::handler::Handler;
use crate::port;
use actor::Actor;
use command::{Command, Mailbox};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_transport::{Link, Listener};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identity of a [`Manager`], shared by every connection it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct ManagerInner<M: Message> {
    id: ManagerId,
    mailbox: Mailbox<M>,
    config: NetworkConfig,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Message> Drop for ManagerInner<M> {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Command::Stop);
    }
}

/// Networking manager
///
/// Cloning is cheap; all clones drive the same actor. The actor stops when
/// [`shutdown`](Self::shutdown) completes or the last clone is dropped.
pub struct Manager<M: Message> {
    inner: Arc<ManagerInner<M>>,
}

impl<M: Message> Clone for Manager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Message> Manager<M> {
    /// Create a manager with an empty in-memory user directory.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: NetworkConfig,
        codec: Arc<dyn Codec<M>>,
        handler: Arc<dyn Handler<M>>,
    ) -> Result<Self> {
        Self::with_directory(config, codec, handler, Arc::new(MemoryUserDirectory::new()))
    }

    /// Create a manager that authenticates against `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] if `config` fails validation.
    pub fn with_directory(
        config: NetworkConfig,
        codec: Arc<dyn Codec<M>>,
        handler: Arc<dyn Handler<M>>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let id = ManagerId::next();
        let (mailbox, commands) = mpsc::unbounded_channel();
        let actor = Actor::new(id, config.clone(), codec, handler, directory, mailbox.clone());
        let handle = tokio::spawn(actor.run(commands));
        debug!(manager = ?id, "manager created");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                id,
                mailbox,
                config,
                actor: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Identity shared with this manager's connections.
    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    /// Active configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command<M>) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inner
            .mailbox
            .send(build(reply))
            .map_err(|_| NetworkError::Closed)?;
        response.await.map_err(|_| NetworkError::Closed)
    }

    // ============ Hosts ============

    /// Start accepting connections from `listener`.
    ///
    /// # Errors
    ///
    /// Returns the bind failure, or [`NetworkError::Closed`] after shutdown.
    pub async fn host(&self, listener: Arc<dyn Listener>) -> Result<HostId> {
        let host = self
            .ask(|reply| Command::AddHost { listener, reply })
            .await?;
        port::open(&host).await?;
        info!(host = host.id(), listener = %host.label(), "host opened");
        Ok(host.id())
    }

    /// Stop accepting on a host. Established connections stay open.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] for an unknown host.
    pub async fn close_host(&self, id: HostId) -> Result<()> {
        let host = self
            .ask(|reply| Command::CloseHost { host: id, reply })
            .await?
            .ok_or(NetworkError::invalid_state("unknown host"))?;
        port::close(host.as_ref()).await;
        info!(host = id, "host closed");
        Ok(())
    }

    // ============ Connections ============

    /// Open an outgoing connection over `link` and run the handshake.
    ///
    /// With `credentials` the connection authenticates (or registers) over
    /// SRP before `Connect` and everything after is encrypted. Returns the
    /// connection and the server's connect response.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::Authentication`] if the server refused the credentials
    ///   or requires authentication
    /// - [`NetworkError::RequestRejected`] if the server's handler rejected
    ///   the connect request
    /// - [`NetworkError::Timeout`] if setup exceeded `setup_timeout`
    /// - transport errors from opening the link
    pub async fn connect(
        &self,
        link: Arc<dyn Link>,
        request: Option<M>,
        credentials: Option<Credentials>,
    ) -> Result<(ConnectionRef<M>, Option<M>)> {
        let (connection, handshake) = self
            .ask(|reply| Command::Attach {
                link,
                request,
                credentials,
                reply,
            })
            .await??;
        let id = connection.id();

        port::open(&connection).await?;
        self.inner
            .mailbox
            .send(Command::Begin { connection: id })
            .map_err(|_| NetworkError::Closed)?;

        let setup_timeout = self.inner.config.connection.setup_timeout;
        match tokio::time::timeout(setup_timeout, handshake).await {
            Ok(Ok(Ok(response))) => Ok((connection as ConnectionRef<M>, response)),
            Ok(Ok(Err(err))) => {
                debug!(connection = id, "connect failed: {}", err);
                Err(err)
            }
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => {
                let err = NetworkError::timeout("connection setup timed out");
                port::drop_with(connection.as_ref(), err.clone()).await;
                Err(err)
            }
        }
    }

    /// Create an in-process connection pair. Both ends use this manager's
    /// handler; the incoming end's `on_connection` runs before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::RequestRejected`] if the handler rejected the
    /// connect request.
    pub async fn connect_local(&self, request: Option<M>) -> Result<LocalPair<M>> {
        self.ask(|reply| Command::ConnectLocal { request, reply })
            .await?
    }

    /// Snapshot of every connected connection.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] after shutdown.
    pub async fn connections(&self) -> Result<Vec<ConnectionRef<M>>> {
        self.ask(|reply| Command::Connections { reply }).await
    }

    // ============ Channels ============

    /// Create a replicated channel. It reaches no one until
    /// [`Channel::open`] attaches a connection.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] after shutdown.
    pub async fn open_channel(&self, profile: Option<M>) -> Result<Channel<M>> {
        let id = self
            .ask(|reply| Command::OpenChannel { profile, reply })
            .await?;
        Ok(Channel::new(id, self.inner.id, self.inner.mailbox.clone()))
    }

    // ============ Lifecycle ============

    /// Close every host, then every connection, then stop the actor.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(actor) = self.inner.actor.lock().await.take() else {
            return;
        };

        if let Ok((hosts, connections)) = self.ask(|reply| Command::Shutdown { reply }).await {
            info!(
                hosts = hosts.len(),
                connections = connections.len(),
                "manager shutting down"
            );
            for host in hosts {
                port::close(host.as_ref()).await;
            }
            for connection in connections {
                connection.close().await;
            }
        }

        let _ = self.inner.mailbox.send(Command::Stop);
        if let Err(err) = actor.await {
            debug!("manager actor ended abnormally: {}", err);
        }
    }
}
