use std::io::{self, Write};

use super::{BlockCompressor, CompressStatus, CompressionBuffer, CompressionBufferMut};
use crate::events::{LogLevel, LogSink, tracing_sink};
use crate::{Error, Result};

const SCRATCH_SIZE: usize = 64 * 1024;

/// A byte sink that can be finished.
///
/// `close` finalises this stage and then every stage below it. Closing twice
/// is a no-op.
pub trait Sink: Write + Send {
    fn close(&mut self) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Bottom of a sink chain: a plain writer that is flushed on close.
pub struct Destination<W> {
    inner: W,
}

impl<W: Write + Send> Destination<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> Write for Destination<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Send> Sink for Destination<W> {
    fn close(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Exposes a [`BlockCompressor`] as a writer over another sink.
///
/// Dropping an unclosed sink still ends the compressed stream; failures at
/// that point can only be reported to the log sink.
pub struct CompressorSink<S: Sink> {
    codec: Box<dyn BlockCompressor>,
    inner: Option<S>,
    scratch: Box<[u8]>,
    closed: bool,
    log: LogSink,
}

impl<S: Sink> CompressorSink<S> {
    pub fn new(codec: Box<dyn BlockCompressor>, inner: S) -> Self {
        Self::with_scratch_size(codec, inner, SCRATCH_SIZE)
    }

    /// `scratch_size` bounds how much compressed output is produced per
    /// codec call.
    pub fn with_scratch_size(
        codec: Box<dyn BlockCompressor>,
        inner: S,
        scratch_size: usize,
    ) -> Self {
        Self {
            codec,
            inner: Some(inner),
            scratch: vec![0u8; scratch_size.max(1)].into_boxed_slice(),
            closed: false,
            log: tracing_sink(),
        }
    }

    pub fn log_sink(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    /// Closes the stream and returns the sink below it.
    pub fn finish(mut self) -> Result<S> {
        self.close()?;
        self.inner.take().ok_or(Error::Disposed)
    }

    fn compress_all(&mut self, buf: &[u8]) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::Disposed)?;
        let mut input = CompressionBuffer::new(buf);
        loop {
            let mut output = CompressionBufferMut::new(&mut self.scratch);
            let status = self.codec.compress(&mut input, &mut output)?;
            inner.write_all(output.written())?;
            if status == CompressStatus::Complete {
                return Ok(());
            }
        }
    }

    fn flush_codec(&mut self) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::Disposed)?;
        loop {
            let mut output = CompressionBufferMut::new(&mut self.scratch);
            let status = self.codec.flush(&mut output)?;
            inner.write_all(output.written())?;
            if status == CompressStatus::Complete {
                return Ok(());
            }
        }
    }
}

impl<S: Sink> Write for CompressorSink<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Error::Disposed.into());
        }
        if let Err(err) = self.compress_all(buf) {
            self.closed = true;
            self.codec.cleanup();
            return Err(err.into());
        }
        Ok(buf.len())
    }

    /// Flushes the sink below; the codec keeps its buffered state.
    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<S: Sink> Sink for CompressorSink<S> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = self.flush_codec();
        self.codec.cleanup();
        flushed?;

        match self.inner.as_mut() {
            Some(inner) => inner.close(),
            None => Ok(()),
        }
    }
}

impl<S: Sink> Drop for CompressorSink<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            (self.log)(
                LogLevel::Error,
                &format!("{} stream was not closed cleanly: {err}", self.codec.name()),
            );
        }
    }
}
