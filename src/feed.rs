//! Turns a "producer writes into a sink" stage into a readable stream.

use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::ring::{RingBuffer, RingWriter};
use crate::signal::AbortSignal;
use crate::{Error, Result};

type Failure = Arc<Mutex<Option<Arc<Error>>>>;

/// Runs a producer on its own thread and exposes what it writes as [`Read`].
///
/// A producer failure always wins over data: once the producer has failed,
/// reads return its error even if bytes are still buffered.
pub struct FeedBridge {
    ring: Arc<RingBuffer>,
    failure: Failure,
    abort: AbortSignal,
    producer: Option<JoinHandle<()>>,
}

impl FeedBridge {
    pub fn spawn<F>(buffer_size: usize, producer: F) -> Result<Self>
    where
        F: FnOnce(RingWriter, &AbortSignal) -> Result<()> + Send + 'static,
    {
        let ring = Arc::new(RingBuffer::new(buffer_size));
        let failure: Failure = Arc::new(Mutex::new(None));
        let abort = AbortSignal::new();

        let handle = thread::Builder::new()
            .name("tarflow-feed".to_string())
            .spawn({
                let ring = ring.clone();
                let failure = failure.clone();
                let abort = abort.clone();
                move || {
                    if let Err(err) = producer(RingWriter::new(ring.clone()), &abort) {
                        tracing::debug!(error = %err, "feed producer failed");
                        *failure.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(Arc::new(err));
                        abort.request();
                    }
                    ring.close();
                }
            })?;

        Ok(Self {
            ring,
            failure,
            abort,
            producer: Some(handle),
        })
    }

    /// Signal observed by the producer; setting it asks the producer to stop.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn failure(&self) -> Option<Arc<Error>> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn raise_failure(&self) -> io::Result<()> {
        match self.failure() {
            Some(err) => {
                self.ring.close();
                Err(io::Error::new(err.io_kind(), err))
            }
            None => Ok(()),
        }
    }

    /// Cancels the producer and waits for it. Producer errors are dropped.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.producer.take() else {
            return;
        };

        self.abort.request();
        self.ring.close();
        if handle.join().is_err() {
            tracing::warn!("feed producer thread panicked");
        }
    }
}

impl Read for FeedBridge {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raise_failure()?;

        let read = self.ring.read(buf);
        if read == 0 {
            self.raise_failure()?;
        }
        Ok(read)
    }
}

impl Drop for FeedBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
