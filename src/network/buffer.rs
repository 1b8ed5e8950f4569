//! Buffer pool for the tunnel hot path.
//!
//! Tunnel reads and response construction both take their scratch space
//! from a shared pool so a steady stream of DNS packets does not allocate
//! per packet.

use std::sync::Arc;

use parking_lot::Mutex;

/// Largest IP packet read from the tunnel in one go.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Capacity given to freshly allocated buffers.
///
/// IPv6 (40) + UDP (8) + a 1024 byte upstream answer fits comfortably.
const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// A buffer borrowed from a [`BufferPool`], handed back on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PooledBuffer {
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Resize the buffer, zero-filling any new bytes.
    #[inline]
    pub fn resize(&mut self, len: usize) {
        debug_assert!(len <= MAX_PACKET_SIZE);
        self.data.resize(len, 0);
    }

    /// Shrink the buffer to `len` bytes, e.g. after a short read.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the contents out, leaving the storage to return to the pool.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.data);
        buffer.clear();
        // Full-size read buffers are kept; anything larger was a one-off.
        if buffer.capacity() <= MAX_PACKET_SIZE {
            self.pool.lock().push(buffer);
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A shared pool of packet buffers.
#[derive(Clone)]
pub struct BufferPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    initial_capacity: usize,
}

impl BufferPool {
    /// Create a pool holding `pool_size` pre-allocated buffers.
    pub fn new(pool_size: usize) -> Self {
        let buffers: Vec<Vec<u8>> = (0..pool_size)
            .map(|_| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))
            .collect();

        Self {
            buffers: Arc::new(Mutex::new(buffers)),
            initial_capacity: pool_size,
        }
    }

    /// Take an empty buffer, allocating if the pool is drained.
    pub fn get(&self) -> PooledBuffer {
        let data = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY));

        PooledBuffer {
            data,
            pool: Arc::clone(&self.buffers),
        }
    }

    /// Take a buffer of `len` zero bytes.
    pub fn get_zeroed(&self, len: usize) -> PooledBuffer {
        let mut buffer = self.get();
        buffer.data.resize(len, 0);
        buffer
    }

    /// Take a buffer sized for one tunnel read.
    pub fn get_packet(&self) -> PooledBuffer {
        self.get_zeroed(MAX_PACKET_SIZE)
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    pub const fn capacity(&self) -> usize {
        self.initial_capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}
