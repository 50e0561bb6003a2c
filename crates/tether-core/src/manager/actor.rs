//! The manager actor.
//!
//! One task per manager owns every registry: connections with their pending
//! requests and received channels, hosts, and owned channels. Nothing here
//! is locked; all mutation happens while handling one [`Command`] at a time.
//!
//! # Handshake
//!
//! ```text
//!  client                                        server
//!    │ ── Register / Authenticate ─────────────>  │  (credentials only)
//!    │ <──────────────────────── CreateSession ── │
//!    │ ── StartSession ────────────────────────>  │  verify proof
//!    │ <══════════════════════════════ Secure ═══ │  encrypted from here
//!    │ ══ Connect(request) ═══════════════════>   │  on_connection
//!    │ <═══════════════ CompleteConnect(resp) ═══ │
//! ```
//!
//! Without credentials the client starts at `Connect`. A server that
//! refuses at any step sends `Disconnect(reason)` and drops the connection.

use crate::auth::{
    AUTHENTICATION_FAILED, AUTHENTICATION_REQUIRED, Credentials, User, UserDirectory,
};
use crate::block::BlockPool;
use crate::channel::{ChannelProvider, Delivery, ReceivedChannel};
use crate::codec::{Codec, Message};
use crate::config::NetworkConfig;
use crate::connection::{ConnectionRef, LocalConnection, NetworkConnection, RemoteConnection};
use crate::control::ControlMessage;
use crate::error::{NetworkError, Result};
use crate::format::{FormatReceiver, FormatSender, FrameHandler, Outbound};
use crate::handler::{Handler, Responder};
use crate::id::Tracker;
use crate::manager::ManagerId;
use crate::manager::command::{ChannelCommand, Command, Mailbox};
use crate::manager::host::Host;
use crate::port;
use crate::sender::SendQueue;
use crate::wire::Header;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tether_crypto::{Authenticator, CryptoError, ServerSession};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStage {
    Idle,
    AwaitSession,
    AwaitSecure,
    AwaitComplete,
    Failed,
}

enum ServerStage {
    AwaitHello,
    AwaitResponse {
        session: ServerSession,
        profile: Option<Vec<u8>>,
    },
    AwaitConnect,
    Failed,
}

enum Setup<M> {
    Client {
        credentials: Option<Credentials>,
        request: Option<M>,
        stage: ClientStage,
        done: Option<oneshot::Sender<Result<Option<M>>>>,
    },
    Server {
        accepted_at: Instant,
        stage: ServerStage,
    },
    Complete,
}

struct RemoteEntry<M: Message> {
    connection: Arc<RemoteConnection<M>>,
    requests: Tracker<oneshot::Sender<Result<M>>>,
    received: HashMap<i32, ReceivedChannel>,
    setup: Setup<M>,
    closing: bool,
    /// Outcome decided by the peer's `Disconnect`; wins over the link error
    /// of the hang-up that follows it
    farewell: Option<Option<NetworkError>>,
}

enum Entry<M: Message> {
    /// ID held while a local pair is being built
    Reserved,
    Remote(Box<RemoteEntry<M>>),
    Local(Arc<LocalConnection<M>>),
}

pub(crate) struct Actor<M: Message> {
    manager: ManagerId,
    config: NetworkConfig,
    handler: Arc<dyn Handler<M>>,
    directory: Arc<dyn UserDirectory>,
    format: Arc<FormatSender<M>>,
    receiver: Arc<FormatReceiver<M>>,
    mailbox: Mailbox<M>,
    connections: Tracker<Entry<M>>,
    hosts: Tracker<Arc<Host<M>>>,
    channels: ChannelProvider<M>,
}

impl<M: Message> Actor<M> {
    pub(crate) fn new(
        manager: ManagerId,
        config: NetworkConfig,
        codec: Arc<dyn Codec<M>>,
        handler: Arc<dyn Handler<M>>,
        directory: Arc<dyn UserDirectory>,
        mailbox: Mailbox<M>,
    ) -> Self {
        let pool = BlockPool::new(config.pool.block_capacity, config.pool.max_blocks);
        Self {
            format: Arc::new(FormatSender::new(Arc::clone(&codec), pool)),
            receiver: Arc::new(FormatReceiver::new(codec, config.connection.max_frame_size)),
            connections: Tracker::new(1, config.connection.connection_id_reuse_delay),
            hosts: Tracker::new(1, config.host_id_reuse_delay),
            channels: ChannelProvider::new(
                config.channel.resend_delay,
                config.channel.channel_id_reuse_delay,
                config.channel.skip_unchanged_updates,
            ),
            manager,
            config,
            handler,
            directory,
            mailbox,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<M>>) {
        let mut tick = tokio::time::interval(self.config.channel.resend_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("manager actor started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = tick.tick() => self.tick(Instant::now()),
            }
        }

        debug!(
            connections = self.connections.len(),
            hosts = self.hosts.len(),
            "manager actor stopped"
        );
    }

    fn handle(&mut self, command: Command<M>) {
        match command {
            Command::Accepted { host, link } => self.on_accepted(host, link),
            Command::Frame { connection, bytes } => self.on_frame(connection, &bytes),
            Command::Released {
                connection,
                error,
                connected,
            } => self.on_released(connection, error, connected),
            Command::HostReleased { host } => {
                self.hosts.remove(host);
                debug!(host, "host released");
            }
            Command::Attach {
                link,
                request,
                credentials,
                reply,
            } => {
                let (done, handshake) = oneshot::channel();
                let id = self.connections.insert(Entry::Reserved);
                let connection = self.remote_connection(id, true, link);
                self.fill(
                    id,
                    connection.clone(),
                    Setup::Client {
                        credentials,
                        request,
                        stage: ClientStage::Idle,
                        done: Some(done),
                    },
                );
                let _ = reply.send(Ok((connection, handshake)));
            }
            Command::Begin { connection } => {
                if let Err(err) = self.begin(connection) {
                    self.fail(connection, err);
                }
            }
            Command::Request {
                connection,
                message,
                reply,
                registered,
            } => {
                let _ = registered.send(self.register_request(connection, &message, reply));
            }
            Command::ExpireRequest {
                connection,
                request,
            } => {
                if let Some(Entry::Remote(entry)) = self.connections.get_mut(connection) {
                    if entry.requests.remove(request).is_some() {
                        trace!(connection, request, "request expired");
                    }
                }
            }
            Command::ConnectLocal { request, reply } => {
                let _ = reply.send(self.connect_local(request));
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.connected());
            }
            Command::AddHost { listener, reply } => {
                let mailbox = self.mailbox.clone();
                let mut created = None;
                self.hosts.insert_with(|id| {
                    let host = Host::new(id, listener, mailbox);
                    created = Some(Arc::clone(&host));
                    host
                });
                if let Some(host) = created {
                    let _ = reply.send(host);
                }
            }
            Command::CloseHost { host, reply } => {
                let _ = reply.send(self.hosts.get(host).cloned());
            }
            Command::OpenChannel { profile, reply } => {
                let id = self.channels.create(profile);
                debug!(channel = id, "channel created");
                let _ = reply.send(id);
            }
            Command::Channel(command) => self.on_channel(command),
            Command::Shutdown { reply } => {
                let hosts = self.hosts.iter().map(|(_, host)| Arc::clone(host)).collect();
                let connections = self
                    .connections
                    .iter()
                    .filter_map(|(_, entry)| handle_of(entry))
                    .collect();
                let _ = reply.send((hosts, connections));
            }
            Command::Stop => {}
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Registry
    // ═══════════════════════════════════════════════════════════════════════

    fn remote_connection(
        &self,
        id: u32,
        outgoing: bool,
        link: Arc<dyn tether_transport::Link>,
    ) -> Arc<RemoteConnection<M>> {
        RemoteConnection::new(
            id,
            outgoing,
            link,
            Arc::clone(&self.format),
            self.manager,
            self.mailbox.clone(),
            self.config.connection.request_timeout,
        )
    }

    fn fill(&mut self, id: u32, connection: Arc<RemoteConnection<M>>, setup: Setup<M>) {
        if let Some(slot) = self.connections.get_mut(id) {
            *slot = Entry::Remote(Box::new(RemoteEntry {
                connection,
                requests: Tracker::new(1, self.config.connection.request_id_reuse_delay),
                received: HashMap::new(),
                setup,
                closing: false,
                farewell: None,
            }));
        }
    }

    fn remote(&mut self, id: u32) -> Result<&mut RemoteEntry<M>> {
        match self.connections.get_mut(id) {
            Some(Entry::Remote(entry)) => Ok(entry),
            _ => Err(NetworkError::Closed),
        }
    }

    fn connected(&self) -> Vec<ConnectionRef<M>> {
        self.connections
            .iter()
            .filter_map(|(_, entry)| handle_of(entry))
            .filter(|connection| connection.is_connected())
            .collect()
    }

    fn on_accepted(&mut self, host: u32, link: Arc<dyn tether_transport::Link>) {
        let id = self.connections.insert(Entry::Reserved);
        let connection = self.remote_connection(id, false, link);
        self.fill(
            id,
            connection.clone(),
            Setup::Server {
                accepted_at: Instant::now(),
                stage: ServerStage::AwaitHello,
            },
        );
        info!(host, connection = id, peer = %connection.peer(), "connection accepted");
        tokio::spawn(async move {
            if let Err(err) = port::open(&connection).await {
                debug!(connection = id, "inbound connection failed to open: {}", err);
            }
        });
    }

    fn connect_local(&mut self, request: Option<M>) -> Result<crate::connection::LocalPair<M>> {
        let outgoing = self.connections.insert(Entry::Reserved);
        let incoming = self.connections.insert(Entry::Reserved);
        let result = LocalConnection::connect_with(
            (outgoing, incoming),
            Arc::clone(&self.handler),
            Arc::clone(&self.handler),
            request,
            self.config.connection.request_timeout,
            Some((self.manager, self.mailbox.clone())),
        );
        match &result {
            Ok(pair) => {
                if let Some(slot) = self.connections.get_mut(outgoing) {
                    *slot = Entry::Local(Arc::clone(&pair.outgoing));
                }
                if let Some(slot) = self.connections.get_mut(incoming) {
                    *slot = Entry::Local(Arc::clone(&pair.incoming));
                }
            }
            Err(err) => {
                self.connections.remove(outgoing);
                self.connections.remove(incoming);
                debug!("local connect rejected: {}", err);
            }
        }
        result
    }

    fn on_released(&mut self, id: u32, error: Option<NetworkError>, connected: bool) {
        let left = self.channels.detach_all(id);
        match self.connections.remove(id) {
            Some(Entry::Remote(entry)) => {
                let RemoteEntry {
                    connection,
                    requests,
                    setup,
                    farewell,
                    ..
                } = *entry;
                let error = farewell.unwrap_or(error);
                if let Setup::Client {
                    done: Some(done), ..
                } = setup
                {
                    let _ = done.send(Err(error.clone().unwrap_or(NetworkError::Closed)));
                }
                // Dropping the pending replies fails their requesters with Closed
                drop(requests);
                if connected {
                    let handle: ConnectionRef<M> = connection;
                    self.handler.on_disconnected(&handle, error.as_ref());
                }
                info!(connection = id, channels = left.len(), "connection released");
            }
            Some(Entry::Local(_)) => debug!(connection = id, "local connection released"),
            _ => {}
        }
    }

    /// Disconnect and drop a remote connection once.
    fn fail(&mut self, id: u32, error: NetworkError) {
        let Some(Entry::Remote(entry)) = self.connections.get_mut(id) else {
            return;
        };
        if entry.closing {
            return;
        }
        entry.closing = true;
        let connection = Arc::clone(&entry.connection);
        if let Some(reason) = disconnect_reason(&error) {
            let _ = connection.send_disconnect(Some(reason));
        }
        tokio::spawn(async move {
            port::drop_with(connection.as_ref(), error).await;
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════

    fn register_request(
        &mut self,
        id: u32,
        message: &M,
        reply: oneshot::Sender<Result<M>>,
    ) -> Result<u32> {
        let entry = self.remote(id)?;
        if entry.closing || !entry.connection.is_connected() {
            return Err(NetworkError::Closed);
        }
        let request = entry.requests.insert(reply);
        if let Err(err) = entry.connection.send_request(request, message) {
            entry.requests.remove(request);
            return Err(err);
        }
        trace!(connection = id, request, "request sent");
        Ok(request)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Frames
    // ═══════════════════════════════════════════════════════════════════════

    fn on_frame(&mut self, id: u32, bytes: &[u8]) {
        let connection = match self.connections.get(id) {
            Some(Entry::Remote(entry)) if !entry.closing => Arc::clone(&entry.connection),
            _ => {
                trace!(connection = id, "frame for closed connection");
                return;
            }
        };

        let receiver = Arc::clone(&self.receiver);
        let result = match Header::decode(bytes) {
            Ok((header, _)) => {
                let mut dispatch = Dispatch {
                    actor: &mut *self,
                    id,
                    connection: &connection,
                    encrypted: header.encrypted,
                };
                receiver.receive(bytes, connection.encryptor(), &mut dispatch)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            warn!(connection = id, "rejecting frame: {}", err);
            self.fail(id, err);
        }
    }

    fn begin(&mut self, id: u32) -> Result<()> {
        let entry = self.remote(id)?;
        let connection = Arc::clone(&entry.connection);
        let Setup::Client {
            credentials,
            request,
            stage,
            ..
        } = &mut entry.setup
        else {
            return Err(NetworkError::invalid_state("not an outgoing connection"));
        };
        if *stage != ClientStage::Idle {
            return Err(NetworkError::invalid_state("handshake already started"));
        }

        match credentials {
            Some(credentials) if credentials.register => {
                let verifier =
                    Authenticator::create_verifier(&credentials.identifier, &credentials.secret)?;
                *stage = ClientStage::AwaitSession;
                connection.send_control(&ControlMessage::Register {
                    identifier: credentials.identifier.clone(),
                    verifier,
                })
            }
            Some(credentials) => {
                *stage = ClientStage::AwaitSession;
                connection.send_control(&ControlMessage::Authenticate {
                    identifier: credentials.identifier.clone(),
                })
            }
            None => {
                *stage = ClientStage::AwaitComplete;
                connection.send_control(&ControlMessage::Connect {
                    request: request.take(),
                })
            }
        }
    }

    fn on_control(
        &mut self,
        id: u32,
        connection: &Arc<RemoteConnection<M>>,
        message: ControlMessage<M>,
        encrypted: bool,
    ) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        match message {
            ControlMessage::Disconnect { reason } => self.on_disconnect(id, connection, reason),
            ControlMessage::RejectRequest { request, reason } => {
                if let Some(reply) = self.remote(id)?.requests.remove(request) {
                    let _ = reply.send(Err(NetworkError::rejected(reason)));
                }
                Ok(())
            }
            ControlMessage::OpenChannel { channel, profile } => {
                require_connected(connection)?;
                if channel <= 0 {
                    return Err(NetworkError::protocol("invalid channel id"));
                }
                let limit = self.config.channel.max_received_channels;
                let received = &mut self.remote(id)?.received;
                if !received.contains_key(&channel) && received.len() >= limit {
                    return Err(NetworkError::protocol("too many channels"));
                }
                received.insert(channel, ReceivedChannel::new());
                let handle: ConnectionRef<M> = connection.clone();
                handler.on_channel_opened(&handle, channel, profile);
                Ok(())
            }
            ControlMessage::CloseChannel { channel } => {
                if self.remote(id)?.received.remove(&channel).is_some() {
                    let handle: ConnectionRef<M> = connection.clone();
                    handler.on_channel_closed(&handle, channel);
                }
                Ok(())
            }
            message if connection.is_outgoing() => {
                self.client_handshake(id, connection, message, encrypted)
            }
            message => self.server_handshake(id, connection, message),
        }
    }

    fn on_disconnect(
        &mut self,
        id: u32,
        connection: &Arc<RemoteConnection<M>>,
        reason: Option<String>,
    ) -> Result<()> {
        connection.suppress_disconnect();
        let entry = self.remote(id)?;
        let error = match &entry.setup {
            Setup::Complete => None,
            Setup::Server { .. } => Some(NetworkError::Closed),
            Setup::Client {
                credentials, stage, ..
            } => {
                let text = reason.clone().unwrap_or_else(|| "disconnected".to_string());
                let authenticating = credentials.is_some()
                    && matches!(stage, ClientStage::AwaitSession | ClientStage::AwaitSecure);
                if authenticating || reason.as_deref() == Some(AUTHENTICATION_REQUIRED) {
                    Some(NetworkError::Authentication(Cow::Owned(text)))
                } else {
                    Some(NetworkError::rejected(text))
                }
            }
        };
        debug!(connection = id, reason = ?reason, "peer disconnected");
        entry.closing = true;
        entry.farewell = Some(error.clone());
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            match error {
                Some(error) => port::drop_with(connection.as_ref(), error).await,
                None => port::close(connection.as_ref()).await,
            }
        });
        Ok(())
    }

    fn client_handshake(
        &mut self,
        id: u32,
        connection: &Arc<RemoteConnection<M>>,
        message: ControlMessage<M>,
        encrypted: bool,
    ) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let entry = self.remote(id)?;
        let Setup::Client {
            credentials,
            request,
            stage,
            done,
        } = &mut entry.setup
        else {
            return Err(NetworkError::protocol("unexpected handshake frame"));
        };
        let current = std::mem::replace(stage, ClientStage::Failed);

        match (message, current) {
            (ControlMessage::CreateSession { session }, ClientStage::AwaitSession) => {
                let credentials = credentials
                    .as_ref()
                    .ok_or(NetworkError::protocol("session without credentials"))?;
                let (encryptor, response) = Authenticator::create_encryptor(
                    &session,
                    &credentials.identifier,
                    &credentials.secret,
                )?;
                connection.install_encryptor(encryptor)?;
                connection.send_control(&ControlMessage::StartSession { response })?;
                *stage = ClientStage::AwaitSecure;
                Ok(())
            }
            (ControlMessage::Secure { identifier }, ClientStage::AwaitSecure) => {
                if !encrypted {
                    return Err(NetworkError::protocol("unencrypted secure confirmation"));
                }
                connection.mark_secure(User {
                    identifier,
                    profile: None,
                });
                debug!(connection = id, "session secured");
                connection.send_control(&ControlMessage::Connect {
                    request: request.take(),
                })?;
                *stage = ClientStage::AwaitComplete;
                Ok(())
            }
            (ControlMessage::CompleteConnect { response }, ClientStage::AwaitComplete) => {
                let done = done.take();
                entry.setup = Setup::Complete;
                connection.mark_connected();
                info!(
                    connection = id,
                    secure = connection.is_secure(),
                    "connected"
                );
                let handle: ConnectionRef<M> = connection.clone();
                handler.on_connected(&handle, response.as_ref());
                if let Some(done) = done {
                    let _ = done.send(Ok(response));
                }
                Ok(())
            }
            _ => Err(NetworkError::protocol("unexpected handshake frame")),
        }
    }

    fn server_handshake(
        &mut self,
        id: u32,
        connection: &Arc<RemoteConnection<M>>,
        message: ControlMessage<M>,
    ) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let directory = Arc::clone(&self.directory);
        let policy = self.config.auth.clone();
        let entry = self.remote(id)?;
        let Setup::Server { stage, .. } = &mut entry.setup else {
            return Err(NetworkError::protocol("unexpected handshake frame"));
        };
        let current = std::mem::replace(stage, ServerStage::Failed);

        match (message, current) {
            (ControlMessage::Register { identifier, verifier }, ServerStage::AwaitHello) => {
                if !policy.allow_registration {
                    return Err(NetworkError::authentication("registration disabled"));
                }
                directory
                    .register(&identifier, verifier)
                    .map_err(|reason| NetworkError::Authentication(Cow::Owned(reason)))?;
                info!(connection = id, identifier = %identifier, "user registered");
                *stage = start_session(directory.as_ref(), connection, identifier)?;
                Ok(())
            }
            (ControlMessage::Authenticate { identifier }, ServerStage::AwaitHello) => {
                *stage = start_session(directory.as_ref(), connection, identifier)?;
                Ok(())
            }
            (
                ControlMessage::StartSession { response },
                ServerStage::AwaitResponse { session, profile },
            ) => {
                let identifier = session.identifier().to_string();
                let encryptor = session.create_encryptor(&response).map_err(|err| match err {
                    CryptoError::Authentication(_) => {
                        NetworkError::authentication(AUTHENTICATION_FAILED)
                    }
                    other => other.into(),
                })?;
                connection.install_encryptor(encryptor)?;
                connection.mark_secure(User {
                    identifier: identifier.clone(),
                    profile,
                });
                info!(connection = id, identifier = %identifier, "user authenticated");
                connection.send_control(&ControlMessage::Secure { identifier })?;
                *stage = ServerStage::AwaitConnect;
                Ok(())
            }
            (
                ControlMessage::Connect { request },
                ServerStage::AwaitHello | ServerStage::AwaitConnect,
            ) => {
                if policy.require_authentication && !connection.is_secure() {
                    return Err(NetworkError::authentication(AUTHENTICATION_REQUIRED));
                }
                let handle: ConnectionRef<M> = connection.clone();
                let response = handler
                    .on_connection(&handle, request.as_ref())
                    .map_err(NetworkError::rejected)?;
                connection.send_control(&ControlMessage::CompleteConnect { response })?;
                connection.mark_connected();
                entry.setup = Setup::Complete;
                info!(
                    connection = id,
                    secure = connection.is_secure(),
                    "connection established"
                );
                handler.on_connected(&handle, request.as_ref());
                Ok(())
            }
            _ => Err(NetworkError::protocol("unexpected handshake frame")),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Channels
    // ═══════════════════════════════════════════════════════════════════════

    fn on_channel(&mut self, command: ChannelCommand<M>) {
        match command {
            ChannelCommand::Attach {
                channel,
                connection,
            } => {
                let profile = match self.channels.get(channel) {
                    Some(state) if state.contains(connection) => return,
                    Some(state) => state.profile().cloned(),
                    None => {
                        debug!(channel, "attach to unknown channel");
                        return;
                    }
                };
                let local = match self.connections.get(connection) {
                    Some(Entry::Remote(entry)) if entry.connection.is_connected() => {
                        if let Err(err) = entry
                            .connection
                            .send_control(&ControlMessage::OpenChannel { channel, profile })
                        {
                            debug!(channel, connection, "channel open failed: {}", err);
                            return;
                        }
                        false
                    }
                    Some(Entry::Local(local)) => {
                        local.deliver_channel_opened(channel, profile);
                        true
                    }
                    _ => {
                        debug!(channel, connection, "attach to unknown connection");
                        return;
                    }
                };
                match self.channels.attach(channel, connection, local) {
                    Ok(Some(delivery)) => self.deliver(channel, delivery),
                    Ok(None) => {}
                    Err(err) => debug!(channel, "attach failed: {}", err),
                }
            }
            ChannelCommand::Update { channel, message } => {
                match self.channels.update(channel, message, Instant::now()) {
                    Ok(Some(delivery)) => self.deliver(channel, delivery),
                    Ok(None) => trace!(channel, "unchanged update skipped"),
                    Err(err) => debug!(channel, "update failed: {}", err),
                }
            }
            ChannelCommand::Detach {
                channel,
                connection,
            } => {
                if self.channels.detach(channel, connection) {
                    self.send_channel_closed(channel, connection);
                }
            }
            ChannelCommand::Close { channel } => {
                if let Some(state) = self.channels.close(channel) {
                    for (connection, _) in state.members() {
                        self.send_channel_closed(channel, connection);
                    }
                    debug!(channel, "channel closed");
                }
            }
        }
    }

    fn send_channel_closed(&self, channel: i32, connection: u32) {
        match self.connections.get(connection) {
            Some(Entry::Remote(entry)) => {
                let _ = entry
                    .connection
                    .send_control(&ControlMessage::CloseChannel { channel });
            }
            Some(Entry::Local(local)) => local.deliver_channel_closed(channel),
            _ => {}
        }
    }

    fn deliver(&self, channel: i32, delivery: Delivery<M>) {
        let Delivery {
            sequence,
            message,
            remote,
            local,
        } = delivery;

        if !remote.is_empty() {
            match self.format.update(channel, sequence, &message) {
                Ok(outbound) => self.send_update(&outbound, &remote),
                Err(err) => warn!(channel, "channel update encode failed: {}", err),
            }
        }
        for id in local {
            if let Some(Entry::Local(connection)) = self.connections.get(id) {
                connection.deliver_channel_update(channel, message.clone());
            }
        }
    }

    /// Plaintext targets share one sealed block; secure targets are sealed
    /// per connection.
    fn send_update(&self, outbound: &Outbound, targets: &[u32]) {
        let mut plain = Vec::new();
        for id in targets {
            let Some(Entry::Remote(entry)) = self.connections.get(*id) else {
                continue;
            };
            if entry.connection.is_secure() {
                if let Err(err) = entry.connection.send_outbound(outbound) {
                    debug!(connection = *id, "channel update dropped: {}", err);
                }
            } else {
                plain.push(entry.connection.sender());
            }
        }
        if plain.is_empty() {
            return;
        }
        match self.format.seal(outbound, None) {
            Ok(block) => {
                let delivered = SendQueue::fan_out(&block, plain);
                trace!(channel = outbound.magnitude, delivered, "channel update fanned out");
            }
            Err(err) => warn!("channel update seal failed: {}", err),
        }
    }

    fn on_update(&mut self, id: u32, channel: i32, sequence: u8, message: M) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let format = Arc::clone(&self.format);
        let entry = self.remote(id)?;
        require_connected(&entry.connection)?;
        let connection = Arc::clone(&entry.connection);
        let Some(received) = entry.received.get_mut(&channel) else {
            trace!(connection = id, channel, "update for unopened channel");
            return Ok(());
        };
        if received.should_ack(sequence) {
            connection.send_outbound(&format.sync(channel, sequence))?;
        }
        if received.accept(sequence) {
            let handle: ConnectionRef<M> = connection;
            handler.on_channel_update(&handle, channel, message);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    fn tick(&mut self, now: Instant) {
        for (channel, delivery) in self.channels.tick(now) {
            trace!(channel, targets = delivery.remote.len(), "channel resend");
            self.deliver(channel, delivery);
        }

        let setup_timeout = self.config.connection.setup_timeout;
        let expired: Vec<u32> = self
            .connections
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Remote(entry) if !entry.closing => match entry.setup {
                    Setup::Server { accepted_at, .. }
                        if now.saturating_duration_since(accepted_at) >= setup_timeout =>
                    {
                        Some(id)
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect();
        for id in expired {
            warn!(connection = id, "connection setup timed out");
            self.fail(id, NetworkError::timeout("setup timeout"));
        }
    }
}

/// Routes one parsed frame into the actor.
struct Dispatch<'a, M: Message> {
    actor: &'a mut Actor<M>,
    id: u32,
    connection: &'a Arc<RemoteConnection<M>>,
    encrypted: bool,
}

impl<M: Message> Dispatch<'_, M> {
    fn handle(&self) -> ConnectionRef<M> {
        self.connection.clone()
    }
}

impl<M: Message> FrameHandler<M> for Dispatch<'_, M> {
    fn accepts_plaintext(&self) -> bool {
        !self.connection.is_secure()
    }

    fn on_message(&mut self, message: M) -> Result<()> {
        require_connected(self.connection)?;
        self.actor.handler.on_received(&self.handle(), message);
        Ok(())
    }

    fn on_request(&mut self, id: u32, message: M) -> Result<()> {
        require_connected(self.connection)?;
        let responder = Responder::remote(Arc::clone(self.connection), id);
        self.actor
            .handler
            .on_request(&self.handle(), message, responder);
        Ok(())
    }

    fn on_response(&mut self, id: u32, message: M) -> Result<()> {
        match self.actor.remote(self.id)?.requests.remove(id) {
            Some(reply) => {
                let _ = reply.send(Ok(message));
            }
            None => trace!(connection = self.id, request = id, "late response dropped"),
        }
        Ok(())
    }

    fn on_update(&mut self, channel: i32, sequence: u8, message: M) -> Result<()> {
        self.actor.on_update(self.id, channel, sequence, message)
    }

    fn on_sync(&mut self, channel: i32, sequence: u8) -> Result<()> {
        require_connected(self.connection)?;
        if !self.actor.channels.on_sync(channel, self.id, sequence) {
            trace!(connection = self.id, channel, sequence, "stale sync ignored");
        }
        Ok(())
    }

    fn on_control(&mut self, message: ControlMessage<M>) -> Result<()> {
        self.actor
            .on_control(self.id, self.connection, message, self.encrypted)
    }
}

fn require_connected<M: Message>(connection: &RemoteConnection<M>) -> Result<()> {
    if connection.is_connected() {
        Ok(())
    } else {
        Err(NetworkError::protocol("frame before connect"))
    }
}

fn handle_of<M: Message>(entry: &Entry<M>) -> Option<ConnectionRef<M>> {
    match entry {
        Entry::Remote(entry) => Some(entry.connection.clone() as ConnectionRef<M>),
        Entry::Local(local) => Some(local.clone() as ConnectionRef<M>),
        Entry::Reserved => None,
    }
}

/// Look the user up and send `CreateSession`.
fn start_session<M: Message>(
    directory: &dyn UserDirectory,
    connection: &RemoteConnection<M>,
    identifier: String,
) -> Result<ServerStage> {
    let record = directory
        .lookup(&identifier)
        .ok_or(NetworkError::authentication(AUTHENTICATION_FAILED))?;
    let session = Authenticator::create_session(&identifier, &record.verifier)?;
    connection.send_control(&ControlMessage::CreateSession {
        session: session.data().to_vec(),
    })?;
    Ok(ServerStage::AwaitResponse {
        session,
        profile: record.profile,
    })
}

/// Reason sent in `Disconnect` when failing a connection, if any.
fn disconnect_reason(error: &NetworkError) -> Option<String> {
    match error {
        NetworkError::Authentication(reason)
        | NetworkError::RequestRejected(reason)
        | NetworkError::Timeout(reason) => Some(reason.to_string()),
        NetworkError::Protocol(reason) => Some(format!("protocol error: {reason}")),
        NetworkError::Crypto(_) | NetworkError::Codec(_) => Some(error.to_string()),
        _ => None,
    }
}
