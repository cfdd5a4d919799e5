use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

const MIN_CAPACITY: usize = 64;

#[derive(Default)]
struct PoolState {
    returned: Vec<Vec<u8>>,
    free: Vec<Vec<u8>>,
    closed: bool,
}

/// Pooled byte buffers for host I/O. A `ByteBuffer` may be dropped on any thread, but it only
/// becomes reusable once the owning runtime drains the pool at the end of `update`.
pub struct ByteBufferPool {
    state: Mutex<PoolState>,
    max_pooled: usize,
}

impl ByteBufferPool {
    pub(crate) fn new(max_pooled: usize) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(PoolState::default()), max_pooled })
    }

    /// Returns an empty buffer holding at least `min_capacity` bytes, reusing a pooled one when it fits.
    pub fn alloc(self: &Arc<Self>, min_capacity: usize) -> ByteBuffer {
        let wanted = min_capacity.max(MIN_CAPACITY).next_power_of_two();
        let reused = {
            let mut state = self.state.lock();
            let fits = state.free.iter().position(|data| data.capacity() >= wanted);
            fits.map(|index| state.free.swap_remove(index))
        };
        let data = reused.unwrap_or_else(|| Vec::with_capacity(wanted));
        ByteBuffer { data, pool: Arc::clone(self) }
    }

    /// Buffers ready for reuse.
    pub fn pooled(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Buffers released since the last drain.
    pub fn pending_returns(&self) -> usize {
        self.state.lock().returned.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn give_back(&self, mut data: Vec<u8>) {
        let mut state = self.state.lock();
        if state.closed || data.capacity() == 0 {
            return;
        }
        data.clear();
        state.returned.push(data);
    }

    /// Moves released buffers into the free list and trims it to the pool size, keeping the
    /// largest buffers. Returns how many buffers were recycled.
    pub(crate) fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let returned = std::mem::take(&mut state.returned);
        let recycled = returned.len();
        state.free.extend(returned);
        if state.free.len() > self.max_pooled {
            state.free.sort_by_key(|data| std::cmp::Reverse(data.capacity()));
            state.free.truncate(self.max_pooled);
        }
        recycled
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.returned.clear();
        state.free.clear();
    }
}

/// Growable byte buffer that goes back to its pool when dropped.
pub struct ByteBuffer {
    data: Vec<u8>,
    pool: Arc<ByteBufferPool>,
}

impl Deref for ByteBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for ByteBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer").field("len", &self.data.len()).field("capacity", &self.data.capacity()).finish()
    }
}

impl Drop for ByteBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_reused_only_after_a_drain() {
        let pool = ByteBufferPool::new(4);
        let mut buffer = pool.alloc(100);
        assert_eq!(buffer.capacity(), 128);
        buffer.extend_from_slice(b"payload");
        drop(buffer);
        assert_eq!(pool.pending_returns(), 1);
        assert_eq!(pool.pooled(), 0);

        assert_eq!(pool.drain(), 1);
        assert_eq!(pool.pooled(), 1);
        let reused = pool.alloc(16);
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), 128);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn drain_keeps_the_largest_buffers() {
        let pool = ByteBufferPool::new(2);
        let buffers: Vec<_> = [64, 256, 1024].into_iter().map(|size| pool.alloc(size)).collect();
        drop(buffers);
        assert_eq!(pool.drain(), 3);
        assert_eq!(pool.pooled(), 2);
        assert_eq!(pool.alloc(1024).capacity(), 1024);
        assert_eq!(pool.alloc(200).capacity(), 256);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn closed_pools_drop_returns() {
        let pool = ByteBufferPool::new(4);
        let buffer = pool.alloc(8);
        pool.close();
        drop(buffer);
        assert_eq!(pool.pending_returns(), 0);
        assert_eq!(pool.drain(), 0);
        assert!(pool.is_closed());
    }
}
