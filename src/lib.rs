//! Streaming tar archiving with stackable, optionally parallel compression.
//!
//! A [`TarWriter`] turns filesystem paths into a GNU tar stream and writes it
//! into a [`Sink`], usually a chain of compressor stages ending at a
//! [`Destination`]. When the consumer wants to pull bytes instead of having
//! them pushed, [`FeedBridge`] runs the whole producer side on its own thread
//! behind a [`RingBuffer`].

pub mod archive;
pub mod compress;
mod error;
pub mod events;
pub mod feed;
pub mod pool;
pub mod ring;
pub mod signal;
pub mod tarball;

pub use self::archive::{ArchiveOptions, archive_files, feed_archive};
pub use self::compress::{
    BlockCompressor, CodecOptions, CompressorKind, CompressorSink, Destination,
    ParallelGzipSink, Sink, compressor_chain,
};
pub use self::error::{Error, Result};
pub use self::events::{EntryObserver, LogLevel, LogSink};
pub use self::feed::FeedBridge;
pub use self::ring::RingBuffer;
pub use self::signal::AbortSignal;
pub use self::tarball::{EntryKind, TarEntry, TarWriter};
