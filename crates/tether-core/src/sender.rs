//! Per-destination send queues.
//!
//! Each remote connection owns one [`Sender`] (the enqueue side) and one
//! [`SenderPump`] (the drain side, owned by the connection's port pump).
//! [`SendQueue::fan_out`] delivers one sealed block to many senders so a
//! single buffer serves every destination.

use crate::block::Block;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_transport::{Link, TransportResult};
use tokio::sync::mpsc;
use tracing::trace;

/// Enqueue side of a destination FIFO.
#[derive(Debug, Clone)]
pub struct Sender {
    queue: mpsc::UnboundedSender<Arc<Block>>,
    enqueued: Arc<AtomicU64>,
}

impl Sender {
    /// Create a connected sender/pump pair.
    #[must_use]
    pub fn channel() -> (Sender, SenderPump) {
        let (queue, pending) = mpsc::unbounded_channel();
        (
            Sender {
                queue,
                enqueued: Arc::new(AtomicU64::new(0)),
            },
            SenderPump { pending },
        )
    }

    /// Queue a block. Returns false if the pump is gone.
    pub fn enqueue(&self, block: Arc<Block>) -> bool {
        let ok = self.queue.send(block).is_ok();
        if ok {
            self.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Total blocks accepted by this sender.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Returns true once the pump has been dropped.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Drain side of a destination FIFO.
#[derive(Debug)]
pub struct SenderPump {
    pending: mpsc::UnboundedReceiver<Arc<Block>>,
}

impl SenderPump {
    /// Wait for the next queued block.
    pub async fn next(&mut self) -> Option<Arc<Block>> {
        self.pending.recv().await
    }

    /// Write one block to the link; the block returns to its pool when dropped here.
    ///
    /// # Errors
    /// Returns the link's send failure.
    pub async fn write(link: &dyn Link, block: Arc<Block>) -> TransportResult<()> {
        trace!(bytes = block.len(), reliability = ?block.reliability(), "sending block");
        link.send(block.as_slice(), block.reliability()).await
    }

    /// Send everything already queued, without waiting for more.
    ///
    /// # Errors
    /// Returns the first link failure; remaining blocks are discarded.
    pub async fn flush(&mut self, link: &dyn Link) -> TransportResult<usize> {
        let mut sent = 0;
        while let Ok(block) = self.pending.try_recv() {
            Self::write(link, block).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

/// Fans one block out to many destinations.
#[derive(Debug, Default)]
pub struct SendQueue;

impl SendQueue {
    /// Enqueue `block` on every sender, returning the number of deliveries.
    pub fn fan_out<'a>(block: &Arc<Block>, senders: impl IntoIterator<Item = &'a Sender>) -> usize {
        senders
            .into_iter()
            .filter(|sender| sender.enqueue(block.clone()))
            .count()
    }
}
