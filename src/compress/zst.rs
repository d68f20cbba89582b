use zstd::stream::raw::{Encoder, InBuffer, Operation, OutBuffer};

use super::{BlockCompressor, CompressStatus, CompressionBuffer, CompressionBufferMut, ZstdOptions};
use crate::{Error, Result};

const NAME: &str = "zstd";

pub struct ZstdCompressor {
    encoder: Option<Encoder<'static>>,
    finished: bool,
}

impl ZstdCompressor {
    pub fn new(options: &ZstdOptions) -> Result<Self> {
        let encoder = Encoder::new(options.level()).map_err(|err| Error::codec(NAME, err))?;
        Ok(Self {
            encoder: Some(encoder),
            finished: false,
        })
    }
}

impl BlockCompressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compress(
        &mut self,
        input: &mut CompressionBuffer<'_>,
        output: &mut CompressionBufferMut<'_>,
    ) -> Result<CompressStatus> {
        let encoder = self.encoder.as_mut().ok_or(Error::Disposed)?;
        if self.finished {
            return Err(Error::codec(NAME, "stream already finished"));
        }

        while !input.is_empty() {
            if output.is_full() {
                return Ok(CompressStatus::More);
            }

            let (consumed, produced) = {
                let mut src = InBuffer::around(input.remaining());
                let mut dst = OutBuffer::around(output.spare());
                encoder
                    .run(&mut src, &mut dst)
                    .map_err(|err| Error::codec(NAME, err))?;
                (src.pos, dst.pos())
            };
            input.advance(consumed);
            output.advance(produced);
        }
        Ok(CompressStatus::Complete)
    }

    fn flush(&mut self, output: &mut CompressionBufferMut<'_>) -> Result<CompressStatus> {
        let encoder = self.encoder.as_mut().ok_or(Error::Disposed)?;
        if self.finished {
            return Ok(CompressStatus::Complete);
        }

        let (remaining, produced) = {
            let mut dst = OutBuffer::around(output.spare());
            let remaining = encoder
                .finish(&mut dst, true)
                .map_err(|err| Error::codec(NAME, err))?;
            (remaining, dst.pos())
        };
        output.advance(produced);

        if remaining == 0 {
            self.finished = true;
            Ok(CompressStatus::Complete)
        } else {
            Ok(CompressStatus::More)
        }
    }

    fn cleanup(&mut self) {
        self.encoder = None;
    }
}
