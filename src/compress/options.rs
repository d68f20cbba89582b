use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Compression formats a pipeline stage can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressorKind {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl CompressorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Conventional file extension of a tar archive compressed with this codec.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => ".tar.gz",
            Self::Bzip2 => ".tar.bz2",
            Self::Xz => ".tar.xz",
            Self::Zstd => ".tar.zst",
        }
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressorKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Self::Gzip),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "xz" | "lzma" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            other => Err(Error::options("codec", format!("unknown codec `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GzipOptions {
    level: u32,
    threads: usize,
    chunk_size: usize,
}

impl GzipOptions {
    pub const DEFAULT_LEVEL: u32 = 6;
    pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

    pub fn new(level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::options(
                "gzip",
                format!("level {level} is outside 0..=9"),
            ));
        }
        Ok(Self {
            level,
            ..Self::default()
        })
    }

    /// More than one thread selects the parallel compressor.
    pub fn with_threads(mut self, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::options("gzip", "thread count must be at least 1"));
        }
        self.threads = threads;
        Ok(self)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::options("gzip", "chunk size must be greater than zero"));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for GzipOptions {
    fn default() -> Self {
        Self {
            level: Self::DEFAULT_LEVEL,
            threads: 1,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bzip2Options {
    block_size: u32,
    work_factor: u32,
}

impl Bzip2Options {
    /// `block_size` is in units of 100 KB, like `bzip2 -1` .. `-9`.
    pub fn new(block_size: u32) -> Result<Self> {
        if !(1..=9).contains(&block_size) {
            return Err(Error::options(
                "bzip2",
                format!("block size {block_size} is outside 1..=9"),
            ));
        }
        Ok(Self {
            block_size,
            work_factor: 0,
        })
    }

    /// 0 keeps the library default (30).
    pub fn with_work_factor(mut self, work_factor: u32) -> Result<Self> {
        if work_factor > 250 {
            return Err(Error::options(
                "bzip2",
                format!("work factor {work_factor} is outside 0..=250"),
            ));
        }
        self.work_factor = work_factor;
        Ok(self)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn work_factor(&self) -> u32 {
        self.work_factor
    }
}

impl Default for Bzip2Options {
    fn default() -> Self {
        Self {
            block_size: 9,
            work_factor: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XzOptions {
    level: u32,
    threads: Option<u32>,
    block_size: u64,
}

impl XzOptions {
    pub const DEFAULT_LEVEL: u32 = 6;

    pub fn new(level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::options("xz", format!("level {level} is outside 0..=9")));
        }
        Ok(Self {
            level,
            ..Self::default()
        })
    }

    /// Selects the multithreaded encoder.
    pub fn with_threads(mut self, threads: u32) -> Result<Self> {
        if threads == 0 {
            return Err(Error::options("xz", "thread count must be at least 1"));
        }
        self.threads = Some(threads);
        Ok(self)
    }

    /// Uncompressed size of each independently encoded block; 0 lets the
    /// encoder pick one from the preset.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn threads(&self) -> Option<u32> {
        self.threads
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

impl Default for XzOptions {
    fn default() -> Self {
        Self {
            level: Self::DEFAULT_LEVEL,
            threads: None,
            block_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZstdOptions {
    level: i32,
}

impl ZstdOptions {
    pub const DEFAULT_LEVEL: i32 = 3;

    pub fn new(level: i32) -> Result<Self> {
        if !(1..=22).contains(&level) {
            return Err(Error::options("zstd", format!("level {level} is outside 1..=22")));
        }
        Ok(Self { level })
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdOptions {
    fn default() -> Self {
        Self {
            level: Self::DEFAULT_LEVEL,
        }
    }
}

/// Settings for one stage of a compressor chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecOptions {
    Gzip(GzipOptions),
    Bzip2(Bzip2Options),
    Xz(XzOptions),
    Zstd(ZstdOptions),
}

impl CodecOptions {
    pub fn default_for(kind: CompressorKind) -> Self {
        match kind {
            CompressorKind::Gzip => Self::Gzip(GzipOptions::default()),
            CompressorKind::Bzip2 => Self::Bzip2(Bzip2Options::default()),
            CompressorKind::Xz => Self::Xz(XzOptions::default()),
            CompressorKind::Zstd => Self::Zstd(ZstdOptions::default()),
        }
    }

    pub fn kind(&self) -> CompressorKind {
        match self {
            Self::Gzip(_) => CompressorKind::Gzip,
            Self::Bzip2(_) => CompressorKind::Bzip2,
            Self::Xz(_) => CompressorKind::Xz,
            Self::Zstd(_) => CompressorKind::Zstd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_names_and_aliases() {
        assert_eq!("gzip".parse::<CompressorKind>().unwrap(), CompressorKind::Gzip);
        assert_eq!("BZ2".parse::<CompressorKind>().unwrap(), CompressorKind::Bzip2);
        assert_eq!("xz".parse::<CompressorKind>().unwrap(), CompressorKind::Xz);
        assert_eq!("zst".parse::<CompressorKind>().unwrap(), CompressorKind::Zstd);
        assert!("lz4".parse::<CompressorKind>().is_err());
        assert_eq!(CompressorKind::Zstd.extension(), ".tar.zst");
    }

    #[test]
    fn levels_are_range_checked() {
        assert!(GzipOptions::new(0).is_ok());
        assert!(GzipOptions::new(9).is_ok());
        assert!(matches!(
            GzipOptions::new(10),
            Err(Error::Options { codec: "gzip", .. })
        ));
        assert!(Bzip2Options::new(0).is_err());
        assert!(Bzip2Options::new(9).unwrap().with_work_factor(251).is_err());
        assert!(XzOptions::new(10).is_err());
        assert!(XzOptions::default().with_threads(0).is_err());
        assert!(ZstdOptions::new(0).is_err());
        assert!(ZstdOptions::new(22).is_ok());
    }

    #[test]
    fn gzip_defaults() {
        let options = GzipOptions::default();
        assert_eq!(options.level(), 6);
        assert_eq!(options.threads(), 1);
        assert_eq!(options.chunk_size(), 128 * 1024);
        assert!(options.with_chunk_size(0).is_err());
        assert_eq!(
            CodecOptions::default_for(CompressorKind::Xz).kind(),
            CompressorKind::Xz
        );
    }
}
