//! In-process transport.
//!
//! [`MemoryLink::pair`] returns two connected ends of an unbounded frame
//! pipe. [`MemoryNetwork`] is a named hub of listeners so hosts and clients
//! can find each other without sockets. Frames are delivered whole and in
//! order regardless of the requested [`Reliability`].

use crate::transport::{
    Link, LinkCounters, Listener, Reliability, TransportError, TransportResult, TransportStats,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, trace};

/// One end of an in-process frame pipe.
pub struct MemoryLink {
    label: String,
    peer: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: AsyncMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    counters: LinkCounters,
}

impl MemoryLink {
    /// Create two connected link ends labelled `a` and `b`.
    #[must_use]
    pub fn pair(a: &str, b: &str) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self::new(a, b, a_tx, a_rx)),
            Arc::new(Self::new(b, a, b_tx, b_rx)),
        )
    }

    fn new(
        label: &str,
        peer: &str,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        let (close_signal, _) = watch::channel(false);
        Self {
            label: label.to_string(),
            peer: peer.to_string(),
            outbound: Mutex::new(Some(outbound)),
            inbound: AsyncMutex::new(Some(inbound)),
            closed: AtomicBool::new(false),
            close_signal,
            counters: LinkCounters::default(),
        }
    }

    /// This end's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take the receiving half for manual reads, bypassing [`Link::run`].
    ///
    /// Used by tests that play a raw peer.
    pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound.lock().await.take()
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn connect(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send(&self, frame: &[u8], _reliability: Reliability) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| TransportError::Other("poisoned link".into()))?;
        match outbound.as_ref() {
            Some(tx) if tx.send(frame.to_vec()).is_ok() => {
                self.counters.record_send(frame.len());
                trace!(link = %self.label, bytes = frame.len(), "memory frame sent");
                Ok(())
            }
            _ => {
                self.counters.record_send_error();
                Err(TransportError::Closed)
            }
        }
    }

    async fn run(&self, received: mpsc::UnboundedSender<Vec<u8>>) -> TransportResult<()> {
        let mut inbound = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Other("link already running".into()))?;
        let mut close = self.close_signal.subscribe();

        loop {
            if *close.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = close.changed() => return Ok(()),
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        self.counters.record_recv(frame.len());
                        if received.send(frame).is_err() {
                            return Ok(());
                        }
                    }
                    None => {
                        debug!(link = %self.label, peer = %self.peer, "memory peer hung up");
                        return Err(TransportError::ConnectionFailed(format!(
                            "{} hung up",
                            self.peer
                        )));
                    }
                },
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        self.close_signal.send_replace(true);
        debug!(link = %self.label, "memory link closed");
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

/// Named in-process hub connecting [`MemoryListener`]s and dialers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<Arc<dyn Link>>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener for `name`. It accepts nothing until [`Listener::bind`].
    #[must_use]
    pub fn listener(&self, name: &str) -> MemoryListener {
        MemoryListener {
            name: name.to_string(),
            network: self.clone(),
            bound: AtomicBool::new(false),
            incoming: AsyncMutex::new(None),
        }
    }

    /// Dial a bound listener, returning the client end of a fresh pair.
    ///
    /// # Errors
    /// Returns `TransportError::ConnectionFailed` if nothing is bound at `name`
    pub fn dial(&self, name: &str, label: &str) -> TransportResult<Arc<MemoryLink>> {
        let accept = self
            .listeners
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener at {name}")))?;
        let (client, server) = MemoryLink::pair(label, name);
        accept
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed(format!("listener {name} closed")))?;
        Ok(client)
    }

    /// Returns true if a listener is bound at `name`.
    pub fn is_bound(&self, name: &str) -> bool {
        self.listeners.contains_key(name)
    }
}

/// Listener half of a [`MemoryNetwork`].
pub struct MemoryListener {
    name: String,
    network: MemoryNetwork,
    bound: AtomicBool,
    incoming: AsyncMutex<Option<mpsc::UnboundedReceiver<Arc<dyn Link>>>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn bind(&self) -> TransportResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.network.listeners.entry(self.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::BindFailed(format!(
                    "{} already bound",
                    self.name
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        *self.incoming.lock().await = Some(rx);
        self.bound.store(true, Ordering::SeqCst);
        debug!(listener = %self.name, "memory listener bound");
        Ok(())
    }

    async fn accept(&self) -> TransportResult<Arc<dyn Link>> {
        let mut incoming = self.incoming.lock().await;
        let rx = incoming.as_mut().ok_or(TransportError::Closed)?;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> TransportResult<()> {
        // Only the listener that bound the name may unbind it
        if self.bound.swap(false, Ordering::SeqCst) {
            self.network.listeners.remove(&self.name);
        }
        Ok(())
    }

    fn local_label(&self) -> String {
        self.name.clone()
    }
}
