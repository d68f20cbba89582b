use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    disposing: bool,
}

/// Bounded pool of reusable byte buffers.
///
/// At most `limit` buffers exist at once; `allocate` blocks when all of them
/// are handed out and fails with [`Error::Disposed`] once the pool is disposed.
pub struct BufferPool {
    state: Mutex<PoolState>,
    released: Condvar,
    initial_capacity: usize,
    limit: usize,
}

impl BufferPool {
    pub fn new(initial_capacity: usize, limit: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
                disposing: false,
            }),
            released: Condvar::new(),
            initial_capacity,
            limit: limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out an empty buffer, preferring the largest free one.
    pub fn allocate(&self) -> Result<Vec<u8>> {
        let state = self.lock();
        let mut state = self
            .released
            .wait_while(state, |s| {
                !s.disposing && s.free.is_empty() && s.outstanding + s.free.len() >= self.limit
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.disposing {
            return Err(Error::Disposed);
        }

        let largest = state
            .free
            .iter()
            .enumerate()
            .max_by_key(|(_, buf)| buf.capacity())
            .map(|(index, _)| index);
        let buffer = match largest {
            Some(index) => state.free.swap_remove(index),
            None => Vec::with_capacity(self.initial_capacity),
        };
        state.outstanding += 1;
        Ok(buffer)
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if !state.disposing {
            buffer.clear();
            state.free.push(buffer);
        }
        self.released.notify_one();
    }

    /// Fails every pending and future `allocate`.
    pub fn dispose(&self) {
        let mut state = self.lock();
        state.disposing = true;
        state.free.clear();
        self.released.notify_all();
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }
}
