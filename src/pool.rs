//! Recycling pool for partition read buffers.
//!
//! A bump-plus-free-list allocator of fixed-size blocks. Each task borrows one block
//! to hold its partition's raw bytes and the block goes back on the free list when
//! the [`PooledBuffer`] is dropped, so steady-state reads do not allocate. At most
//! `capacity` idle blocks are retained; surplus blocks are freed on return.

use crate::error::{EngineError, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

struct PoolState {
    free: Vec<Vec<u8>>,
    capacity: usize,
    /// Blocks created so far.
    allocated: usize,
}

/// Fixed-block buffer pool.
#[derive(Clone)]
pub struct BufferPool {
    block_size: usize,
    state: Arc<Mutex<PoolState>>,
}

impl BufferPool {
    /// A pool of `block_size`-byte blocks retaining at most `capacity` idle blocks.
    #[must_use]
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            state: Arc::new(Mutex::new(PoolState {
                free: Vec::new(),
                capacity: capacity.max(1),
                allocated: 0,
            })),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // The state is a plain free list; a panic while holding it cannot corrupt it.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Borrow a block and size it to `req_size` bytes (contents unspecified).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if `req_size` exceeds the block size.
    pub fn allocate(&self, req_size: usize) -> Result<PooledBuffer> {
        if req_size > self.block_size {
            return Err(EngineError::Config(format!(
                "read request of {req_size} bytes exceeds pool block size {}",
                self.block_size
            )));
        }
        let mut state = self.lock();
        let mut block = if let Some(block) = state.free.pop() {
            block
        } else {
            state.allocated += 1;
            Vec::with_capacity(self.block_size)
        };
        drop(state);
        block.resize(req_size, 0);
        Ok(PooledBuffer {
            block: Some(block),
            pool: Arc::clone(&self.state),
        })
    }

    /// Number of blocks currently on the free list.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of blocks ever created by this pool.
    #[must_use]
    pub fn allocated_blocks(&self) -> usize {
        self.lock().allocated
    }
}

/// A block borrowed from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    block: Option<Vec<u8>>,
    pool: Arc<Mutex<PoolState>>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.block.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.block.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut block) = self.block.take() {
            block.clear();
            let mut state = self
                .pool
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if state.free.len() < state.capacity {
                state.free.push(block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_recycled() {
        let pool = BufferPool::new(64, 2);
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(64).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 64);
        drop(a);
        assert_eq!(pool.free_blocks(), 1);
        let c = pool.allocate(32).unwrap();
        assert_eq!(c.len(), 32);
        assert_eq!(pool.allocated_blocks(), 2);
    }

    #[test]
    fn surplus_blocks_are_not_retained() {
        let pool = BufferPool::new(16, 1);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.free_blocks(), 1);
        assert_eq!(pool.allocated_blocks(), 2);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let pool = BufferPool::new(8, 1);
        assert!(pool.allocate(9).is_err());
    }
}
