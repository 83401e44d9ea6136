use std::ops::{Deref, DerefMut};

use crossbeam::channel::{Receiver, Sender, TryRecvError};

/// A growable byte buffer borrowed from a [`BufferPool`].
///
/// The buffer is cleared and handed back to its pool when it is dropped, so
/// the aggregator can reuse the capacity of earlier flushes instead of
/// allocating fresh blocks for every batch of writes.
#[derive(Debug)]
pub struct PooledBuffer {
    bytes: Vec<u8>,
    pool: Sender<Vec<u8>>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.bytes);
        bytes.clear();
        // If send() returns an error, the pool has been dropped. In this case we
        // can also drop the buffer.
        let _ = self.pool.send(bytes);
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded();
        BufferPool { sender, receiver }
    }

    pub fn with_initial_capacity(buffers: usize, capacity: usize) -> Self {
        let pool = Self::new();
        for _ in 0..buffers {
            // Cannot fail, we own both ends.
            let _ = pool.sender.send(Vec::with_capacity(capacity));
        }
        pool
    }

    /// The number of idle buffers.
    pub fn idle(&self) -> usize {
        self.receiver.len()
    }

    pub fn allocate(&self) -> PooledBuffer {
        let bytes = match self.receiver.try_recv() {
            Ok(bytes) => bytes,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Vec::new(),
        };
        PooledBuffer {
            bytes,
            pool: self.sender.clone(),
        }
    }
}
