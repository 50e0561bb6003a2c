//! Port lifecycle state machine.
//!
//! Every openable endpoint (hosts and remote connections) embeds a [`Port`]
//! and implements [`Endpoint`]. The free functions [`open`], [`close`] and
//! [`drop_with`] drive the shared lifecycle:
//!
//! ```text
//! Unopened ──open──> Opening ──link ok──> Opened
//!                       │                   │
//!                       └──────close/drop───┴──> Closing ──> Closed
//! ```
//!
//! Closing signals the pump, awaits it, and only then releases transport
//! resources, so nothing is sent after [`close`] returns.

use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Port lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PortState {
    /// Created, never opened
    Unopened = 0,
    /// Pump started, link in progress
    Opening = 1,
    /// Link established
    Opened = 2,
    /// Shutting down
    Closing = 3,
    /// Terminal
    Closed = 4,
}

impl PortState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PortState::Unopened,
            1 => PortState::Opening,
            2 => PortState::Opened,
            3 => PortState::Closing,
            _ => PortState::Closed,
        }
    }
}

/// Lifecycle bookkeeping shared by every endpoint.
pub struct Port {
    label: String,
    state: AtomicU8,
    opened: AtomicBool,
    shutdown: watch::Sender<bool>,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
    error: Mutex<Option<NetworkError>>,
}

impl Port {
    /// Create an unopened port labelled for logs.
    pub fn new(label: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            label: label.into(),
            state: AtomicU8::new(PortState::Unopened as u8),
            opened: AtomicBool::new(false),
            shutdown,
            pump: AsyncMutex::new(None),
            error: Mutex::new(None),
        }
    }

    /// Log label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state.
    pub fn state(&self) -> PortState {
        PortState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns true while the port is [`PortState::Opened`].
    pub fn is_open(&self) -> bool {
        self.state() == PortState::Opened
    }

    /// Returns true if the port ever reached [`PortState::Opened`].
    pub fn was_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Error that dropped the port, if any.
    pub fn error(&self) -> Option<NetworkError> {
        self.error.lock().ok().and_then(|slot| slot.clone())
    }

    fn transition(&self, from: PortState, to: PortState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `Closing` from any earlier state. Returns false if already there.
    fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if PortState::from_u8(current) >= PortState::Closing {
                return false;
            }
            match self.state.compare_exchange(
                current,
                PortState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn record(&self, error: NetworkError) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(error);
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Hooks implemented by every concrete port.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// The embedded lifecycle state.
    fn port(&self) -> &Port;

    /// Background pump. Must return once `shutdown` flips to true.
    ///
    /// Returning before shutdown, with or without an error, drops the port.
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()>;

    /// Establish the underlying transport.
    async fn link(&self) -> Result<()>;

    /// Graceful goodbye before the pump stops.
    async fn unlink(&self) -> Result<()> {
        Ok(())
    }

    /// Free transport resources after the pump has stopped.
    async fn release(&self);

    /// Called once the port reaches [`PortState::Opened`].
    fn on_opened(&self) {}

    /// Called once closed, only if the port was ever opened.
    fn on_closed(&self, _error: Option<&NetworkError>) {}
}

/// Open `endpoint`: start its pump, then link.
///
/// # Errors
///
/// Returns [`NetworkError::InvalidState`] if the port was already opened,
/// the link failure (after dropping the port), or [`NetworkError::Closed`]
/// if the port was closed while linking.
pub async fn open<E: Endpoint>(endpoint: &Arc<E>) -> Result<()> {
    let port = endpoint.port();
    if !port.transition(PortState::Unopened, PortState::Opening) {
        return Err(NetworkError::invalid_state("port already opened"));
    }
    debug!(port = %port.label, "port opening");

    {
        let mut pump = port.pump.lock().await;
        let runner = Arc::clone(endpoint);
        let shutdown = port.shutdown.subscribe();
        *pump = Some(tokio::spawn(async move {
            let result = Arc::clone(&runner).run(shutdown).await;
            if runner.port().state() < PortState::Closing {
                let error = result.err().unwrap_or(NetworkError::Closed);
                // close() awaits this task, so the drop must run elsewhere
                tokio::spawn(async move {
                    drop_with(runner.as_ref(), error).await;
                });
            }
        }));
    }

    if let Err(err) = endpoint.link().await {
        drop_with(endpoint.as_ref(), err.clone()).await;
        return Err(err);
    }

    if port.transition(PortState::Opening, PortState::Opened) {
        port.opened.store(true, Ordering::SeqCst);
        info!(port = %port.label, "port opened");
        endpoint.on_opened();
        Ok(())
    } else {
        Err(NetworkError::Closed)
    }
}

/// Resolves once `shutdown` is signalled or its port is gone.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Close `endpoint`. Idempotent once closing has begun.
pub async fn close<E: Endpoint + ?Sized>(endpoint: &E) {
    shut(endpoint, None).await;
}

/// Close `endpoint` because of `error`, recording it on the port.
pub async fn drop_with<E: Endpoint + ?Sized>(endpoint: &E, error: NetworkError) {
    shut(endpoint, Some(error)).await;
}

async fn shut<E: Endpoint + ?Sized>(endpoint: &E, error: Option<NetworkError>) {
    let port = endpoint.port();
    if !port.begin_closing() {
        return;
    }

    match &error {
        Some(err) if err.is_expected() => debug!(port = %port.label, "port dropped: {}", err),
        Some(err) => warn!(port = %port.label, "port dropped: {}", err),
        None => debug!(port = %port.label, "port closing"),
    }
    if let Some(err) = &error {
        port.record(err.clone());
    }

    if let Err(err) = endpoint.unlink().await {
        debug!(port = %port.label, "unlink failed: {}", err);
    }

    port.shutdown.send_replace(true);
    let pump = port.pump.lock().await.take();
    if let Some(pump) = pump {
        if let Err(err) = pump.await {
            if err.is_panic() {
                warn!(port = %port.label, "port pump panicked");
            }
        }
    }

    endpoint.release().await;
    port.state.store(PortState::Closed as u8, Ordering::SeqCst);
    info!(port = %port.label, "port closed");

    if port.was_opened() {
        endpoint.on_closed(error.as_ref());
    }
}
