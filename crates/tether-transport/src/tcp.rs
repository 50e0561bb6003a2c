//! TCP transport.
//!
//! Frames are length-prefixed on the stream:
//!
//! ```text
//! +------------------+--------------------+
//! | length (u32 BE)  | frame bytes        |
//! +------------------+--------------------+
//! ```
//!
//! TCP is always ordered, so the requested [`Reliability`] is ignored.

use crate::transport::{
    Link, LinkCounters, Listener, Reliability, TransportError, TransportResult, TransportStats,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

const LISTEN_BACKLOG: i32 = 1024;

/// A TCP connection carrying length-prefixed frames.
pub struct TcpLink {
    remote: SocketAddr,
    max_frame: usize,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    counters: LinkCounters,
}

impl TcpLink {
    /// Create an unconnected link that dials `remote` on [`Link::connect`].
    #[must_use]
    pub fn dial(remote: SocketAddr) -> Self {
        Self::with_halves(remote, None)
    }

    /// Wrap an already-connected stream (accepted by a listener).
    ///
    /// # Errors
    /// Returns `TransportError::Io` if socket options cannot be applied
    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self::with_halves(remote, Some(stream.into_split())))
    }

    fn with_halves(remote: SocketAddr, halves: Option<(OwnedReadHalf, OwnedWriteHalf)>) -> Self {
        let (close_signal, _) = watch::channel(false);
        let (reader, writer) = match halves {
            Some((r, w)) => (Some(r), Some(w)),
            None => (None, None),
        };
        Self {
            remote,
            max_frame: DEFAULT_MAX_FRAME,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_signal,
            counters: LinkCounters::default(),
        }
    }

    /// Override the maximum accepted frame size.
    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Maximum accepted frame size.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    async fn read_frame(&self, reader: &mut OwnedReadHalf) -> TransportResult<Vec<u8>> {
        let len = reader.read_u32().await? as usize;
        if len > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn connect(&self) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(self.remote)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {e}", self.remote)))?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *writer = Some(w);
        debug!(peer = %self.remote, "tcp link connected");
        Ok(())
    }

    async fn send(&self, frame: &[u8], _reliability: Reliability) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if frame.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame,
            });
        }
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::Closed)?;

        let mut buf = Vec::with_capacity(4 + frame.len());
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
        if let Err(e) = stream.write_all(&buf).await {
            self.counters.record_send_error();
            return Err(e.into());
        }
        self.counters.record_send(frame.len());
        Ok(())
    }

    async fn run(&self, received: mpsc::UnboundedSender<Vec<u8>>) -> TransportResult<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Other("link not connected or already running".into()))?;
        let mut close = self.close_signal.subscribe();

        loop {
            if *close.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = close.changed() => return Ok(()),
                frame = self.read_frame(&mut reader) => match frame {
                    Ok(frame) => {
                        self.counters.record_recv(frame.len());
                        if received.send(frame).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        self.counters.record_recv_error();
                        warn!(peer = %self.remote, error = %e, "tcp link dropped");
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_signal.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone.
            let _ = writer.shutdown().await;
        }
        debug!(peer = %self.remote, "tcp link closed");
        Ok(())
    }

    fn peer(&self) -> String {
        self.remote.to_string()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

/// TCP listener producing a [`TcpLink`] per accepted stream.
pub struct TcpHost {
    addr: SocketAddr,
    max_frame: usize,
    listener: Mutex<Option<Arc<TcpListener>>>,
}

impl TcpHost {
    /// Create an unbound host for `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_frame: DEFAULT_MAX_FRAME,
            listener: Mutex::new(None),
        }
    }

    /// Override the maximum accepted frame size for accepted links.
    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Maximum frame size applied to accepted links.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Bound address (resolves port 0 after [`Listener::bind`]).
    pub async fn local_addr(&self) -> TransportResult<SocketAddr> {
        match self.listener.lock().await.as_ref() {
            Some(listener) => Ok(listener.local_addr()?),
            None => Ok(self.addr),
        }
    }
}

#[async_trait]
impl Listener for TcpHost {
    async fn bind(&self) -> TransportResult<()> {
        let domain = if self.addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        info!(addr = %listener.local_addr()?, "tcp host listening");
        *self.listener.lock().await = Some(Arc::new(listener));
        Ok(())
    }

    async fn accept(&self) -> TransportResult<Arc<dyn Link>> {
        let listener = self
            .listener
            .lock()
            .await
            .clone()
            .ok_or(TransportError::Closed)?;
        let (stream, remote) = listener.accept().await?;
        debug!(peer = %remote, "tcp connection accepted");
        let link = TcpLink::from_stream(stream)?.with_max_frame(self.max_frame);
        Ok(Arc::new(link))
    }

    async fn close(&self) -> TransportResult<()> {
        self.listener.lock().await.take();
        Ok(())
    }

    fn local_label(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
