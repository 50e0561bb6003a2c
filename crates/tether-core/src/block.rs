//! Pooled outgoing byte buffers.
//!
//! A frame is written into a [`BlockWriter`] and sealed into an
//! `Arc<Block>`. Every destination sender holds one clone of the `Arc`
//! while the block is in flight; when the last clone drops, the buffer
//! goes back to its pool. Unsealed writers never return their buffer.

use crossbeam_queue::ArrayQueue;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tether_transport::Reliability;

/// Bounded lock-free free-list of byte buffers.
#[derive(Debug)]
pub struct BlockPool {
    free: ArrayQueue<Vec<u8>>,
    block_capacity: usize,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
}

impl BlockPool {
    /// Create a pool keeping at most `max_blocks` idle buffers of `block_capacity` bytes.
    #[must_use]
    pub fn new(block_capacity: usize, max_blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(max_blocks.max(1)),
            block_capacity,
            allocated: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
        })
    }

    /// Start writing a new block.
    pub fn writer(self: &Arc<Self>, reliability: Reliability) -> BlockWriter {
        let buf = match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.block_capacity)
            }
        };
        BlockWriter {
            buf,
            reliability,
            pool: Arc::downgrade(self),
        }
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        // Oversized buffers from large frames are not worth keeping.
        if buf.capacity() > self.block_capacity * 4 {
            return;
        }
        buf.clear();
        if self.free.push(buf).is_ok() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Buffers allocated because the pool was empty.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers returned to the pool.
    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::Relaxed)
    }
}

/// An incomplete block being written.
#[derive(Debug)]
pub struct BlockWriter {
    buf: Vec<u8>,
    reliability: Reliability,
    pool: Weak<BlockPool>,
}

impl BlockWriter {
    /// Append bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append one byte.
    pub fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Mark the block complete and share it.
    pub fn seal(self) -> Arc<Block> {
        Arc::new(Block {
            buf: self.buf,
            reliability: self.reliability,
            pool: self.pool,
        })
    }
}

impl io::Write for BlockWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A complete, immutable frame ready to send.
#[derive(Debug)]
pub struct Block {
    buf: Vec<u8>,
    reliability: Reliability,
    pool: Weak<BlockPool>,
}

impl Block {
    /// Frame bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Delivery constraint for this frame.
    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true for an empty frame.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_returns_after_last_reference() {
        let pool = BlockPool::new(64, 4);
        let mut writer = pool.writer(Reliability::Reliable);
        writer.extend(b"frame");
        let block = writer.seal();
        assert_eq!(block.as_slice(), b"frame");
        assert_eq!(block.reliability(), Reliability::Reliable);

        let in_flight = block.clone();
        drop(block);
        assert_eq!(pool.available(), 0);

        drop(in_flight);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.recycled(), 1);
    }

    #[test]
    fn test_unsealed_writer_not_returned() {
        let pool = BlockPool::new(64, 4);
        let mut writer = pool.writer(Reliability::Ordered);
        writer.push(1);
        drop(writer);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_recycled_buffer_is_reused_and_cleared() {
        let pool = BlockPool::new(64, 4);
        let mut writer = pool.writer(Reliability::Ordered);
        writer.extend(b"first");
        drop(writer.seal());
        assert_eq!(pool.allocated(), 1);

        let writer = pool.writer(Reliability::Unreliable);
        assert!(writer.is_empty());
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_bounded() {
        let pool = BlockPool::new(16, 2);
        let blocks: Vec<_> = (0..4)
            .map(|_| pool.writer(Reliability::Ordered).seal())
            .collect();
        drop(blocks);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocated(), 4);
    }

    #[test]
    fn test_oversized_buffer_discarded() {
        let pool = BlockPool::new(8, 2);
        let mut writer = pool.writer(Reliability::Ordered);
        writer.extend(&[0u8; 256]);
        drop(writer.seal());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_block_outlives_pool() {
        let pool = BlockPool::new(16, 2);
        let block = pool.writer(Reliability::Ordered).seal();
        drop(pool);
        assert!(block.is_empty());
    }
}
