//! Fixed-capacity circular byte buffer shared by one producer and one consumer.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

struct RingState {
    buffer: Box<[u8]>,
    start: usize,
    len: usize,
    closed: bool,
}

impl RingState {
    fn free(&self) -> usize {
        self.buffer.len() - self.len
    }

    /// Copies as much of `bytes` as fits, possibly in two spans.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let capacity = self.buffer.len();
        let count = bytes.len().min(self.free());
        let tail = (self.start + self.len) % capacity;
        let first = count.min(capacity - tail);

        self.buffer[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.buffer[..count - first].copy_from_slice(&bytes[first..count]);
        self.len += count;
        count
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let capacity = self.buffer.len();
        let count = out.len().min(self.len);
        let first = count.min(capacity - self.start);

        out[..first].copy_from_slice(&self.buffer[self.start..self.start + first]);
        out[first..count].copy_from_slice(&self.buffer[..count - first]);
        self.len -= count;
        self.start = if self.len == 0 {
            0
        } else {
            (self.start + count) % capacity
        };
        count
    }
}

/// Blocking single-producer/single-consumer byte queue.
///
/// Both ends work under one lock. `close` wakes every waiter: pending and
/// future writes fail with [`Error::Disposed`], reads drain what is buffered
/// and then report end of stream.
pub struct RingBuffer {
    state: Mutex<RingState>,
    data_ready: Condvar,
    space_ready: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
                start: 0,
                len: 0,
                closed: false,
            }),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Writes all of `bytes`, blocking whenever the buffer is full.
    pub fn write(&self, mut bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        while !bytes.is_empty() {
            state = self
                .space_ready
                .wait_while(state, |s| s.free() == 0 && !s.closed)
                .unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(Error::Disposed);
            }

            let written = state.push(bytes);
            bytes = &bytes[written..];
            self.data_ready.notify_one();
        }
        Ok(())
    }

    /// Reads up to `out.len()` bytes, blocking while the buffer is empty.
    /// Returns 0 once the buffer is closed and drained.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }

        let state = self.lock();
        let mut state = self
            .data_ready
            .wait_while(state, |s| s.len == 0 && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        if state.len == 0 {
            return 0;
        }

        let read = state.pop(out);
        self.space_ready.notify_one();
        read
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }
}

/// Owned write half handed to producers.
#[derive(Clone)]
pub struct RingWriter(Arc<RingBuffer>);

impl RingWriter {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self(ring)
    }
}

impl Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
