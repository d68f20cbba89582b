//! Gzip container over a raw deflate stream.

use std::time::{SystemTime, UNIX_EPOCH};

use flate2::{Compress, Compression, FlushCompress, Status};

use super::{
    BlockCompressor, CompressStatus, CompressionBuffer, CompressionBufferMut, GzipOptions,
};
use crate::{Error, Result};

const NAME: &str = "gzip";
const OS_UNIX: u8 = 3;

/// RFC 1952 member header: deflate method, no flags, current mtime.
pub(crate) fn gzip_header(level: u32) -> [u8; 10] {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(0))
        .unwrap_or(0)
        .to_le_bytes();
    let xfl = if level == 1 { 4 } else { 2 };
    [
        0x1f, 0x8b, 8, 0, mtime[0], mtime[1], mtime[2], mtime[3], xfl, OS_UNIX,
    ]
}

/// CRC32 of the uncompressed data followed by its length mod 2^32.
pub(crate) fn gzip_trailer(crc: u32, len: u64) -> [u8; 8] {
    let mut trailer = [0u8; 8];
    trailer[..4].copy_from_slice(&crc.to_le_bytes());
    trailer[4..].copy_from_slice(&(len as u32).to_le_bytes());
    trailer
}

struct Deflate {
    stream: Compress,
    crc: crc32fast::Hasher,
    /// Header or trailer bytes not yet handed to the caller.
    pending: Vec<u8>,
    pending_at: usize,
    finished: bool,
}

impl Deflate {
    fn drain_pending(&mut self, output: &mut CompressionBufferMut<'_>) {
        self.pending_at += output.put(&self.pending[self.pending_at..]);
        if self.pending_at == self.pending.len() {
            self.pending.clear();
            self.pending_at = 0;
        }
    }

    fn has_pending(&self) -> bool {
        self.pending_at < self.pending.len()
    }
}

/// Single-stream gzip backend.
pub struct GzipCompressor {
    state: Option<Deflate>,
}

impl GzipCompressor {
    pub fn new(options: &GzipOptions) -> Self {
        Self {
            state: Some(Deflate {
                stream: Compress::new(Compression::new(options.level()), false),
                crc: crc32fast::Hasher::new(),
                pending: gzip_header(options.level()).to_vec(),
                pending_at: 0,
                finished: false,
            }),
        }
    }
}

impl BlockCompressor for GzipCompressor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compress(
        &mut self,
        input: &mut CompressionBuffer<'_>,
        output: &mut CompressionBufferMut<'_>,
    ) -> Result<CompressStatus> {
        let state = self.state.as_mut().ok_or(Error::Disposed)?;
        if state.finished {
            return Err(Error::codec(NAME, "stream already finished"));
        }

        state.drain_pending(output);
        while !input.is_empty() {
            if output.is_full() {
                return Ok(CompressStatus::More);
            }

            let before_in = state.stream.total_in();
            let before_out = state.stream.total_out();
            state
                .stream
                .compress(input.remaining(), output.spare(), FlushCompress::None)
                .map_err(|err| Error::codec(NAME, err))?;
            let consumed = (state.stream.total_in() - before_in) as usize;
            let produced = (state.stream.total_out() - before_out) as usize;

            state.crc.update(&input.remaining()[..consumed]);
            input.advance(consumed);
            output.advance(produced);
            if consumed == 0 && produced == 0 {
                return Ok(CompressStatus::More);
            }
        }

        if state.has_pending() {
            return Ok(CompressStatus::More);
        }
        Ok(CompressStatus::Complete)
    }

    fn flush(&mut self, output: &mut CompressionBufferMut<'_>) -> Result<CompressStatus> {
        let state = self.state.as_mut().ok_or(Error::Disposed)?;

        state.drain_pending(output);
        if state.has_pending() {
            return Ok(CompressStatus::More);
        }

        if !state.finished {
            let before_out = state.stream.total_out();
            let status = state
                .stream
                .compress(&[], output.spare(), FlushCompress::Finish)
                .map_err(|err| Error::codec(NAME, err))?;
            output.advance((state.stream.total_out() - before_out) as usize);
            if status != Status::StreamEnd {
                return Ok(CompressStatus::More);
            }

            state.finished = true;
            let crc = state.crc.clone().finalize();
            let trailer = gzip_trailer(crc, state.stream.total_in());
            state.pending.extend_from_slice(&trailer);
            state.drain_pending(output);
        }

        if state.has_pending() {
            Ok(CompressStatus::More)
        } else {
            Ok(CompressStatus::Complete)
        }
    }

    fn cleanup(&mut self) {
        self.state = None;
    }
}
