//! Listening endpoints.

use crate::codec::Message;
use crate::error::{NetworkError, Result};
use crate::manager::command::{Command, Mailbox};
use crate::port::{self, Endpoint, Port};
use async_trait::async_trait;
use std::sync::Arc;
use tether_transport::Listener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Manager-assigned host identifier.
pub type HostId = u32;

/// A [`Listener`] wrapped in a port. Its pump posts every accepted link to
/// the manager actor.
pub struct Host<M: Message> {
    id: HostId,
    port: Port,
    listener: Arc<dyn Listener>,
    bound: watch::Sender<bool>,
    mailbox: Mailbox<M>,
}

impl<M: Message> Host<M> {
    pub(crate) fn new(id: HostId, listener: Arc<dyn Listener>, mailbox: Mailbox<M>) -> Arc<Self> {
        let (bound, _) = watch::channel(false);
        Arc::new(Self {
            id,
            port: Port::new(format!("host {id} ({})", listener.local_label())),
            listener,
            bound,
            mailbox,
        })
    }

    /// Host ID.
    pub fn id(&self) -> HostId {
        self.id
    }

    /// Listener label.
    pub fn label(&self) -> String {
        self.listener.local_label()
    }
}

#[async_trait]
impl<M: Message> Endpoint for Host<M> {
    fn port(&self) -> &Port {
        &self.port
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut bound = self.bound.subscribe();
        tokio::select! {
            _ = port::stopped(&mut shutdown) => return Ok(()),
            ready = async { bound.wait_for(|bound| *bound).await.is_ok() } => {
                if !ready {
                    return Err(NetworkError::Closed);
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = port::stopped(&mut shutdown) => return Ok(()),
                accepted = self.listener.accept() => {
                    let link = accepted?;
                    debug!(host = self.id, peer = %link.peer(), "link accepted");
                    self.mailbox
                        .send(Command::Accepted { host: self.id, link })
                        .map_err(|_| NetworkError::Closed)?;
                }
            }
        }
    }

    async fn link(&self) -> Result<()> {
        self.listener.bind().await?;
        self.bound.send_replace(true);
        info!(host = self.id, listener = %self.listener.local_label(), "host listening");
        Ok(())
    }

    async fn release(&self) {
        if let Err(err) = self.listener.close().await {
            debug!(host = self.id, "listener close failed: {}", err);
        }
        let _ = self.mailbox.send(Command::HostReleased { host: self.id });
    }
}
