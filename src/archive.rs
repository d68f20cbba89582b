//! Archiving a list of files through a compressor chain.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::compress::{CodecOptions, Destination, Sink, compressor_chain};
use crate::events::{EntryObserver, LogLevel, LogSink};
use crate::feed::FeedBridge;
use crate::signal::AbortSignal;
use crate::tarball::TarWriter;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct ArchiveOptions {
    /// Entries below this directory are named `./relative`.
    pub root: Option<PathBuf>,
    pub follow_symlinks: bool,
    /// Applied in order; `codecs[0]` sees the tar stream first.
    pub codecs: Vec<CodecOptions>,
    /// Ring buffer size used by [`feed_archive`].
    pub buffer_size: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            root: None,
            follow_symlinks: false,
            codecs: Vec::new(),
            buffer_size: 1 << 20,
        }
    }
}

impl ArchiveOptions {
    /// File name suffix matching the codec stack, e.g. `.tar.gz`.
    pub fn extension(&self) -> String {
        let mut extension = String::from(".tar");
        for codec in &self.codecs {
            extension.push_str(codec.kind().extension().trim_start_matches(".tar"));
        }
        extension
    }
}

/// Writes `files` as one compressed tar archive into `destination`.
///
/// The abort signal is checked before every entry. On success the tar
/// end-of-archive marker is written and the whole sink chain is closed; on
/// failure the output is incomplete and must be discarded.
pub fn archive_files<I, P>(
    files: I,
    options: &ArchiveOptions,
    destination: Box<dyn Sink>,
    abort: &AbortSignal,
    observer: Option<EntryObserver>,
    log: LogSink,
) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let chain = compressor_chain(&options.codecs, destination, &log)?;
    let mut tar = TarWriter::new(chain)
        .follow_symlinks(options.follow_symlinks)
        .log_sink(log.clone());
    if let Some(root) = &options.root {
        tar = tar.with_root(root)?;
    }
    if let Some(observer) = observer {
        tar = tar.on_entry(observer);
    }

    let mut count = 0u64;
    for file in files {
        abort.check()?;
        let path = file.as_ref();
        tracing::info!(path = %path.display(), "archiving");
        if let Err(err) = tar.add_entry(path) {
            log(
                LogLevel::Error,
                &format!("unable to archive {}: {err}", path.display()),
            );
            return Err(err);
        }
        count += 1;
    }
    abort.check()?;

    let mut chain = tar.finish()?;
    chain.flush()?;
    chain.close()?;
    tracing::debug!(entries = count, "archive complete");
    Ok(())
}

/// Runs [`archive_files`] on a producer thread and returns the readable end
/// of the compressed stream.
pub fn feed_archive(
    files: Vec<PathBuf>,
    options: ArchiveOptions,
    observer: Option<EntryObserver>,
    log: LogSink,
) -> Result<FeedBridge> {
    if options.buffer_size == 0 {
        return Err(Error::options("archive", "buffer size must be greater than zero"));
    }
    FeedBridge::spawn(options.buffer_size, move |writer, abort| {
        archive_files(
            files,
            &options,
            Box::new(Destination::new(writer)),
            abort,
            observer,
            log,
        )
    })
}
