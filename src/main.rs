use anyhow::{Context, Result, anyhow, bail};
use atty::Stream;
use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tarflow::compress::{Bzip2Options, GzipOptions, XzOptions, ZstdOptions};
use tarflow::events::tracing_sink;
use tarflow::{ArchiveOptions, CodecOptions, CompressorKind, EntryObserver, feed_archive};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Archive `PATH`s into a tar stream, optionally through a stack of compressors.
#[derive(Debug, Parser)]
#[command(name = "tarflow", version, about = "Streaming tar archiver with stackable compression")]
struct Args {
    /// Files or directories to archive.
    #[arg(value_name = "PATH", required = true)]
    paths: Vec<PathBuf>,

    /// Write the archive here instead of stdout.
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Archive root; members are named relative to it and relative PATHs
    /// are resolved against it.
    #[arg(short = 'C', long, value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Archive what symlinks point to instead of the links.
    #[arg(short = 'L', long)]
    dereference: bool,

    /// Compressor stage; repeat to stack (first one sees the tar stream).
    #[arg(short = 'z', long = "compress", value_name = "CODEC")]
    compress: Vec<CompressorKind>,

    /// Compression level, applied to every stage (block size for bzip2).
    #[arg(short = 'l', long, allow_negative_numbers = true)]
    level: Option<i32>,

    /// Worker threads for gzip and xz.
    #[arg(short = 'j', long, value_name = "THREADS")]
    jobs: Option<usize>,

    /// Bytes per independently compressed parallel gzip chunk.
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Capacity of the buffer between the archiver and the output.
    #[arg(long, value_name = "BYTES", default_value_t = 1 << 20)]
    buffer_size: usize,

    /// Disable progress reporting.
    #[arg(long)]
    no_progress: bool,
}

fn progress_allowed(no_progress: bool) -> bool {
    !no_progress && atty::is(Stream::Stderr)
}

#[derive(Clone)]
struct ProgressReporter {
    inner: Option<Arc<ProgressInner>>,
}

struct ProgressInner {
    bar: ProgressBar,
    files: AtomicU64,
    bytes: AtomicU64,
    finished: AtomicBool,
}

impl ProgressReporter {
    fn new(label: impl Into<String>, enabled: bool) -> Self {
        if !enabled {
            return Self { inner: None };
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{prefix:.bold} {spinner} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_prefix(label.into());
        let inner = Arc::new(ProgressInner {
            bar,
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });
        inner.update_message();
        Self { inner: Some(inner) }
    }

    fn record_file(&self) {
        if let Some(inner) = &self.inner {
            inner.files.fetch_add(1, Ordering::Relaxed);
            inner.update_message();
        }
    }

    fn add_bytes(&self, bytes: u64) {
        if let Some(inner) = &self.inner {
            inner.bytes.fetch_add(bytes, Ordering::Relaxed);
            inner.update_message();
        }
    }

    fn finish_success(&self) {
        if let Some(inner) = &self.inner {
            inner.finish_with_message("done");
        }
    }

    fn finish_error(&self) {
        if let Some(inner) = &self.inner {
            inner.finish_with_message("failed");
        }
    }
}

impl ProgressInner {
    fn update_message(&self) {
        let files = self.files.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        self.bar
            .set_message(format!("{files} files - {} written", HumanBytes(bytes)));
    }

    fn finish_with_message(&self, status: &str) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.bar
                .finish_with_message(format!("{status} - {}", self.bar.message()));
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    if args.buffer_size == 0 {
        bail!("buffer-size must be greater than zero");
    }
    if args.chunk_size == Some(0) {
        bail!("chunk-size must be greater than zero");
    }

    let progress = ProgressReporter::new("archiving", progress_allowed(args.no_progress));
    let result = run_archive(&args, progress.clone());
    match &result {
        Ok(_) => progress.finish_success(),
        Err(_) => progress.finish_error(),
    }
    result
}

fn run_archive(args: &Args, progress: ProgressReporter) -> Result<()> {
    let jobs = args.jobs.unwrap_or_else(default_jobs).max(1);
    let root = args
        .directory
        .as_deref()
        .map(std::path::absolute)
        .transpose()
        .context("failed to resolve the archive root")?;

    let codecs = args
        .compress
        .iter()
        .map(|&kind| codec_options(kind, args.level, jobs, args.chunk_size))
        .collect::<Result<Vec<_>>>()?;
    let options = ArchiveOptions {
        root: root.clone(),
        follow_symlinks: args.dereference,
        codecs,
        buffer_size: args.buffer_size,
    };

    let files = collect_files(&args.paths, root.as_deref())?;
    tracing::debug!(files = files.len(), jobs, "collected archive members");

    let mut output: Box<dyn Write> = match &args.output {
        Some(path) => {
            let name = path.to_string_lossy();
            if !name.ends_with(&options.extension()) {
                tracing::warn!(
                    "{} does not end with {}, the usual extension for this archive",
                    path.display(),
                    options.extension()
                );
            }
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Box::new(io::BufWriter::new(file))
        }
        None => {
            if atty::is(Stream::Stdout) {
                bail!("refusing to write archive data to a terminal; use -o or redirect stdout");
            }
            Box::new(io::stdout().lock())
        }
    };

    let observer: EntryObserver = {
        let progress = progress.clone();
        Box::new(move |_: &str| progress.record_file())
    };
    let mut bridge = feed_archive(files, options, Some(observer), tracing_sink())?;

    let result = copy_stream(&mut bridge, &mut output, &progress)
        .and_then(|()| output.flush().context("failed to flush the output"));
    if result.is_err() {
        bridge.abort_signal().request();
    }
    bridge.close();
    drop(output);

    if result.is_err() {
        if let Some(path) = &args.output {
            if let Err(err) = fs::remove_file(path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove partial archive"
                );
            }
        }
    }
    result
}

fn copy_stream<R: Read, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    progress: &ProgressReporter,
) -> Result<()> {
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        // Interrupted is not retried: a cancelled feed reports it on every read.
        let read = reader.read(&mut buf).context("archiving failed")?;
        if read == 0 {
            return Ok(());
        }
        writer
            .write_all(&buf[..read])
            .map_err(|err| match err.kind() {
                ErrorKind::BrokenPipe => anyhow!("output closed before the archive was complete"),
                _ => anyhow!(err).context("failed to write the archive"),
            })?;
        progress.add_bytes(read as u64);
    }
}

/// Expands every PATH into the walk order the archive uses.
fn collect_files(paths: &[PathBuf], root: Option<&Path>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let path = match root {
            Some(root) if path.is_relative() => root.join(path),
            _ => std::path::absolute(path)
                .with_context(|| format!("failed to resolve {}", path.display()))?,
        };

        let walker = WalkDir::new(&path).follow_links(false).sort_by_file_name();
        for entry in walker {
            let entry = entry.with_context(|| format!("failed to walk {}", path.display()))?;
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn codec_options(
    kind: CompressorKind,
    level: Option<i32>,
    jobs: usize,
    chunk_size: Option<usize>,
) -> Result<CodecOptions> {
    let unsigned = |level: i32| {
        u32::try_from(level).with_context(|| format!("{kind} level {level} must not be negative"))
    };

    let options = match kind {
        CompressorKind::Gzip => {
            let mut gzip = match level {
                Some(level) => GzipOptions::new(unsigned(level)?)?,
                None => GzipOptions::default(),
            };
            gzip = gzip.with_threads(jobs)?;
            if let Some(chunk_size) = chunk_size {
                gzip = gzip.with_chunk_size(chunk_size)?;
            }
            CodecOptions::Gzip(gzip)
        }
        CompressorKind::Bzip2 => CodecOptions::Bzip2(match level {
            Some(level) => Bzip2Options::new(unsigned(level)?)?,
            None => Bzip2Options::default(),
        }),
        CompressorKind::Xz => {
            let mut xz = match level {
                Some(level) => XzOptions::new(unsigned(level)?)?,
                None => XzOptions::default(),
            };
            if jobs > 1 {
                let threads = u32::try_from(jobs).unwrap_or(u32::MAX);
                xz = xz.with_threads(threads)?;
            }
            CodecOptions::Xz(xz)
        }
        CompressorKind::Zstd => CodecOptions::Zstd(match level {
            Some(level) => ZstdOptions::new(level)?,
            None => ZstdOptions::default(),
        }),
    };
    Ok(options)
}

fn default_jobs() -> usize {
    num_cpus::get().max(1)
}
