//! Push-style compressors and the sinks that drive them.
//!
//! Every backend implements [`BlockCompressor`]: the caller hands it an input
//! view and an output view, drains whatever landed in the output, and calls
//! again until the backend reports [`CompressStatus::Complete`]. A full output
//! view is never an error; it is reported as [`CompressStatus::More`].

pub mod bz2;
pub mod deflate;
pub mod lzma;
mod options;
pub mod parallel;
pub mod sink;
pub mod zst;

pub use self::options::{
    Bzip2Options, CodecOptions, CompressorKind, GzipOptions, XzOptions, ZstdOptions,
};
pub use self::parallel::ParallelGzipSink;
pub use self::sink::{CompressorSink, Destination, Sink};

use crate::Result;
use crate::events::LogSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressStatus {
    /// The output view filled up; drain it and call again.
    More,
    /// All input was consumed (or, for a flush, every trailing byte emitted).
    Complete,
}

/// Read cursor over caller-owned input for one compression round.
#[derive(Debug)]
pub struct CompressionBuffer<'a> {
    data: &'a [u8],
    consumed: usize,
}

impl<'a> CompressionBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, consumed: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.consumed..]
    }

    pub fn is_empty(&self) -> bool {
        self.consumed == self.data.len()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn advance(&mut self, count: usize) {
        self.consumed = (self.consumed + count).min(self.data.len());
    }
}

/// Write cursor over caller-owned output space for one compression round.
#[derive(Debug)]
pub struct CompressionBufferMut<'a> {
    data: &'a mut [u8],
    written: usize,
}

impl<'a> CompressionBufferMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, written: 0 }
    }

    /// Unused tail of the view.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.written..]
    }

    pub fn is_full(&self) -> bool {
        self.written == self.data.len()
    }

    pub fn written(&self) -> &[u8] {
        &self.data[..self.written]
    }

    pub fn advance(&mut self, count: usize) {
        self.written = (self.written + count).min(self.data.len());
    }

    /// Copies as much of `bytes` as fits and returns how many were taken.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.data.len() - self.written);
        self.data[self.written..self.written + count].copy_from_slice(&bytes[..count]);
        self.written += count;
        count
    }
}

/// One codec session.
///
/// Constructing a backend is its initialisation; `cleanup` releases the
/// native state and may be called any number of times. Calls after
/// `cleanup` fail with [`Error::Disposed`](crate::Error::Disposed).
pub trait BlockCompressor: Send {
    fn name(&self) -> &'static str;

    fn compress(
        &mut self,
        input: &mut CompressionBuffer<'_>,
        output: &mut CompressionBufferMut<'_>,
    ) -> Result<CompressStatus>;

    /// Ends the stream, emitting every buffered byte and the trailer.
    fn flush(&mut self, output: &mut CompressionBufferMut<'_>) -> Result<CompressStatus>;

    fn cleanup(&mut self);
}

/// Builds the single-stream backend for `options`.
pub fn compressor(options: &CodecOptions, log: &LogSink) -> Result<Box<dyn BlockCompressor>> {
    Ok(match options {
        CodecOptions::Gzip(options) => Box::new(deflate::GzipCompressor::new(options)),
        CodecOptions::Bzip2(options) => Box::new(bz2::Bzip2Compressor::new(options)),
        CodecOptions::Xz(options) => Box::new(lzma::XzCompressor::new(options, log)?),
        CodecOptions::Zstd(options) => Box::new(zst::ZstdCompressor::new(options)?),
    })
}

/// Stacks one sink per codec on top of `destination`.
///
/// `codecs[0]` is the outermost stage: it receives the bytes written to the
/// returned sink, and the last codec writes into `destination`. Gzip with
/// more than one thread becomes a [`ParallelGzipSink`].
pub fn compressor_chain(
    codecs: &[CodecOptions],
    destination: Box<dyn Sink>,
    log: &LogSink,
) -> Result<Box<dyn Sink>> {
    let mut sink = destination;
    for options in codecs.iter().rev() {
        let stage: Box<dyn Sink> = match options {
            CodecOptions::Gzip(gzip) if gzip.threads() > 1 => {
                Box::new(ParallelGzipSink::new(gzip, sink)?)
            }
            other => {
                let codec = compressor(other, log)?;
                Box::new(CompressorSink::new(codec, sink).log_sink(log.clone()))
            }
        };
        sink = stage;
    }
    Ok(sink)
}
