//! Block-parallel gzip.
//!
//! Input is cut into chunks of `chunk_size` bytes. Workers deflate each chunk
//! on its own with a reset dictionary and end it with a full flush, which
//! leaves the deflate stream byte aligned; the final chunk is empty and ends
//! the stream. Concatenated in order the pieces form one valid deflate
//! stream, so the writer only has to emit them in sequence, between a gzip
//! header and a trailer whose CRC32 is combined from the per-chunk CRCs.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use flate2::{Compress, Compression, FlushCompress, Status};
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::deflate::{gzip_header, gzip_trailer};
use super::{GzipOptions, Sink};
use crate::pool::BufferPool;
use crate::signal::AbortSignal;
use crate::{Error, Result};

const NAME: &str = "gzip";

/// Per-chunk delay injected by tests to shuffle completion order.
type StallHook = fn(u64) -> Duration;

struct QueueState<T> {
    items: BTreeMap<u64, T>,
    next: u64,
    producers: usize,
    closed: bool,
}

/// Reorders items tagged with sequence numbers.
///
/// `take` hands items out strictly in sequence order starting at zero.
/// `put` admits item `seq` only while `seq < next + capacity`, where `next`
/// is the sequence number `take` is waiting for, so the item the consumer
/// needs can always be inserted.
pub struct SequencedQueue<T> {
    state: Mutex<QueueState<T>>,
    item_ready: Condvar,
    space_ready: Condvar,
    capacity: u64,
}

impl<T> SequencedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: BTreeMap::new(),
                next: 0,
                producers: 0,
                closed: false,
            }),
            item_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity: capacity.max(1) as u64,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a producer; the queue counts as finished once every guard
    /// is dropped.
    pub fn register(self: &Arc<Self>) -> ProducerGuard<T> {
        self.lock().producers += 1;
        ProducerGuard(self.clone())
    }

    pub fn put(&self, seq: u64, item: T) -> Result<()> {
        let state = self.lock();
        let mut state = self
            .space_ready
            .wait_while(state, |s| !s.closed && seq >= s.next + self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Error::Disposed);
        }
        if seq < state.next || state.items.contains_key(&seq) {
            return Err(Error::Pipeline(format!("sequence number {seq} delivered twice")));
        }

        state.items.insert(seq, item);
        if seq == state.next {
            self.item_ready.notify_all();
        }
        Ok(())
    }

    /// Next item in sequence; `None` once every producer is gone and nothing
    /// is left.
    pub fn take(&self) -> Result<Option<T>> {
        let state = self.lock();
        let mut state = self
            .item_ready
            .wait_while(state, |s| {
                !s.closed && s.producers > 0 && !s.items.contains_key(&s.next)
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Error::Disposed);
        }

        let next = state.next;
        match state.items.remove(&next) {
            Some(item) => {
                state.next += 1;
                self.space_ready.notify_all();
                Ok(Some(item))
            }
            None if state.items.is_empty() => Ok(None),
            None => Err(Error::Pipeline(
                "compression pipeline terminated with out-of-order chunks".to_string(),
            )),
        }
    }

    /// Fails every pending and future `put` and `take`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.item_ready.notify_all();
        self.space_ready.notify_all();
    }
}

pub struct ProducerGuard<T>(Arc<SequencedQueue<T>>);

impl<T> Drop for ProducerGuard<T> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.producers = state.producers.saturating_sub(1);
        self.0.item_ready.notify_all();
    }
}

enum CrcState {
    Pending,
    Ready(u32),
    Abandoned,
}

/// CRC32 of one chunk, published by the worker after the compressed bytes.
struct CrcSlot {
    state: Mutex<CrcState>,
    ready: Condvar,
}

impl CrcSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CrcState::Pending),
            ready: Condvar::new(),
        })
    }

    fn set(&self, value: CrcState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, CrcState::Pending) {
            *state = value;
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Result<u32> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .ready
            .wait_while(state, |s| matches!(s, CrcState::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            CrcState::Ready(crc) => Ok(crc),
            _ => Err(Error::Pipeline("chunk checksum was never published".to_string())),
        }
    }
}

/// Worker side of a [`CrcSlot`]; abandons the slot if dropped unpublished.
struct CrcPublisher(Arc<CrcSlot>);

impl CrcPublisher {
    fn publish(self, crc: u32) {
        self.0.set(CrcState::Ready(crc));
    }
}

impl Drop for CrcPublisher {
    fn drop(&mut self) {
        self.0.set(CrcState::Abandoned);
    }
}

struct CompressJob {
    seq: u64,
    data: Vec<u8>,
    last: bool,
}

struct WriteJob {
    data: Vec<u8>,
    len: u64,
    crc: Arc<CrcSlot>,
}

/// State shared by the sink, its workers and its writer thread.
struct Shared {
    queue: Arc<SequencedQueue<WriteJob>>,
    input_pool: BufferPool,
    output_pool: BufferPool,
    abort: AbortSignal,
    failure: Mutex<Option<Error>>,
}

impl Shared {
    /// Records the first failure and tears the pipeline down.
    fn fail(&self, err: Error) {
        tracing::debug!(error = %err, "parallel gzip pipeline failed");
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.abort.request();
        self.queue.close();
        self.input_pool.dispose();
        self.output_pool.dispose();
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Error to report once the abort signal is set.
    fn aborted(&self) -> Error {
        self.take_failure().unwrap_or(Error::Cancelled)
    }
}

/// Gzip sink that compresses chunks on a worker pool.
///
/// Output bytes are in write order regardless of which worker finishes
/// first. Closing (or dropping) the sink waits for every chunk and writes
/// the gzip trailer; the sink below is then closed as well.
pub struct ParallelGzipSink<S: Sink + 'static> {
    shared: Arc<Shared>,
    chunk_tx: Option<Sender<CompressJob>>,
    workers: Option<ThreadPool>,
    writer: Option<JoinHandle<Option<S>>>,
    inner: Option<S>,
    pending: Option<Vec<u8>>,
    chunk_size: usize,
    next_seq: u64,
    closed: bool,
}

impl<S: Sink + 'static> ParallelGzipSink<S> {
    pub fn new(options: &GzipOptions, output: S) -> Result<Self> {
        Self::spawn(options, output, None)
    }

    fn spawn(options: &GzipOptions, output: S, stall: Option<StallHook>) -> Result<Self> {
        let jobs = options.threads().max(1);
        let chunk_size = options.chunk_size();
        let queue_depth = jobs * 4;
        let window = jobs * 4;

        let queue = Arc::new(SequencedQueue::new(window));
        let shared = Arc::new(Shared {
            queue: queue.clone(),
            // Queued chunks, one per worker, plus the one being filled.
            input_pool: BufferPool::new(chunk_size, queue_depth + jobs + 1),
            // Reorder window, one per worker, plus the one being written.
            output_pool: BufferPool::new(chunk_size, window + jobs + 1),
            abort: AbortSignal::new(),
            failure: Mutex::new(None),
        });

        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded::<CompressJob>(queue_depth);

        let workers = ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|index| format!("tarflow-gzip-{index}"))
            .build()
            .map_err(|err| Error::codec(NAME, err))?;

        let level = Compression::new(options.level());
        for _ in 0..jobs {
            let worker_rx = chunk_rx.clone();
            let worker_shared = shared.clone();
            let guard = queue.register();
            workers.spawn(move || {
                compression_worker(worker_rx, worker_shared, guard, level, stall)
            });
        }
        drop(chunk_rx);

        let writer = thread::Builder::new()
            .name("tarflow-gzip-writer".to_string())
            .spawn({
                let shared = shared.clone();
                let level = options.level();
                move || write_stream(output, &shared, level)
            })
            .map_err(|err| {
                shared.fail(Error::Pipeline("writer thread failed to start".to_string()));
                Error::Io(err)
            })?;
        tracing::debug!(jobs, chunk_size, "parallel gzip pipeline started");

        Ok(Self {
            shared,
            chunk_tx: Some(chunk_tx),
            workers: Some(workers),
            writer: Some(writer),
            inner: None,
            pending: None,
            chunk_size,
            next_seq: 0,
            closed: false,
        })
    }

    /// Closes the stream and returns the sink below it.
    pub fn finish(mut self) -> Result<S> {
        self.close()?;
        self.inner.take().ok_or(Error::Disposed)
    }

    fn dispatch(&mut self, data: Vec<u8>, last: bool) -> Result<()> {
        let sender = self.chunk_tx.as_ref().ok_or(Error::Disposed)?;
        let job = CompressJob {
            seq: self.next_seq,
            data,
            last,
        };
        if sender.send(job).is_err() {
            return Err(self.shared.aborted());
        }
        self.next_seq += 1;
        Ok(())
    }

    fn dispatch_pending(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(chunk) if !chunk.is_empty() => self.dispatch(chunk, false),
            Some(chunk) => {
                self.shared.input_pool.release(chunk);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn push(&mut self, buf: &[u8]) -> Result<usize> {
        if self.shared.abort.is_set() {
            return Err(self.shared.aborted());
        }

        let mut chunk = match self.pending.take() {
            Some(chunk) => chunk,
            None => match self.shared.input_pool.allocate() {
                Ok(chunk) => chunk,
                Err(_) => return Err(self.shared.aborted()),
            },
        };
        let count = buf.len().min(self.chunk_size - chunk.len());
        chunk.extend_from_slice(&buf[..count]);

        if chunk.len() == self.chunk_size {
            self.dispatch(chunk, false)?;
        } else {
            self.pending = Some(chunk);
        }
        Ok(count)
    }

    fn shutdown(&mut self) -> Result<()> {
        let sent = if self.shared.abort.is_set() {
            Err(self.shared.aborted())
        } else {
            self.dispatch_pending()
                .and_then(|()| self.dispatch(Vec::new(), true))
        };

        // Workers drain the channel and exit once it disconnects.
        self.chunk_tx = None;
        let joined = match self.writer.take() {
            Some(handle) => handle.join(),
            None => Ok(None),
        };
        self.workers = None;

        let output = match joined {
            Ok(output) => output,
            Err(_) => {
                self.shared
                    .fail(Error::Pipeline("gzip writer thread panicked".to_string()));
                None
            }
        };
        sent?;
        if let Some(err) = self.shared.take_failure() {
            return Err(err);
        }

        let mut output = output.ok_or_else(|| {
            Error::Pipeline("gzip writer finished without its output".to_string())
        })?;
        tracing::debug!(chunks = self.next_seq, "parallel gzip pipeline finished");
        output.close()?;
        self.inner = Some(output);
        Ok(())
    }
}

impl<S: Sink + 'static> Write for ParallelGzipSink<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Error::Disposed.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.push(buf)?)
    }

    /// Hands the partially filled chunk to the workers.
    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        Ok(self.dispatch_pending()?)
    }
}

impl<S: Sink + 'static> Sink for ParallelGzipSink<S> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shutdown()
    }
}

impl<S: Sink + 'static> Drop for ParallelGzipSink<S> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "parallel gzip stream was not closed cleanly");
            }
        }
    }
}

fn compression_worker(
    chunk_rx: Receiver<CompressJob>,
    shared: Arc<Shared>,
    _guard: ProducerGuard<WriteJob>,
    level: Compression,
    stall: Option<StallHook>,
) {
    let mut deflate = Compress::new(level, false);
    for job in chunk_rx.iter() {
        if shared.abort.is_set() {
            break;
        }
        if let Err(err) = compress_job(&mut deflate, job, &shared, stall) {
            shared.fail(err);
            break;
        }
    }
}

fn compress_job(
    deflate: &mut Compress,
    job: CompressJob,
    shared: &Shared,
    stall: Option<StallHook>,
) -> Result<()> {
    let mut compressed = shared.output_pool.allocate()?;
    deflate.reset();
    let flush = if job.last {
        FlushCompress::Finish
    } else {
        FlushCompress::Full
    };
    deflate_chunk(deflate, &job.data, &mut compressed, flush)?;

    if let Some(stall) = stall {
        thread::sleep(stall(job.seq));
    }

    let slot = CrcSlot::new();
    let publisher = CrcPublisher(slot.clone());
    shared.queue.put(
        job.seq,
        WriteJob {
            data: compressed,
            len: job.data.len() as u64,
            crc: slot,
        },
    )?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&job.data);
    publisher.publish(hasher.finalize());
    if !job.last {
        shared.input_pool.release(job.data);
    }
    Ok(())
}

/// Deflates all of `input` into `out`, growing it as needed, until `flush`
/// has completed.
fn deflate_chunk(
    deflate: &mut Compress,
    input: &[u8],
    out: &mut Vec<u8>,
    flush: FlushCompress,
) -> Result<()> {
    let start = deflate.total_in();
    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(input.len() / 2 + 1024);
        }

        let consumed = (deflate.total_in() - start) as usize;
        let status = deflate
            .compress_vec(&input[consumed..], out, flush)
            .map_err(|err| Error::codec(NAME, err))?;
        let consumed = (deflate.total_in() - start) as usize;

        // A flush is only complete once it stops short of the output limit.
        let done = match status {
            Status::StreamEnd => true,
            _ if matches!(flush, FlushCompress::Finish) => false,
            _ => consumed == input.len() && out.len() < out.capacity(),
        };
        if done {
            return Ok(());
        }
    }
}

fn write_stream<S: Sink>(mut output: S, shared: &Shared, level: u32) -> Option<S> {
    match drain_queue(&mut output, shared, level) {
        Ok(()) => Some(output),
        Err(err) => {
            shared.fail(err);
            None
        }
    }
}

fn drain_queue<S: Sink>(output: &mut S, shared: &Shared, level: u32) -> Result<()> {
    output.write_all(&gzip_header(level))?;

    let mut crc = crc32fast::Hasher::new();
    let mut total: u64 = 0;
    while let Some(job) = shared.queue.take()? {
        output.write_all(&job.data)?;
        let chunk_crc = job.crc.wait()?;
        crc.combine(&crc32fast::Hasher::new_with_initial_len(chunk_crc, job.len));
        total += job.len;
        shared.output_pool.release(job.data);
    }

    output.write_all(&gzip_trailer(crc.finalize(), total))?;
    output.flush()?;
    Ok(())
}
