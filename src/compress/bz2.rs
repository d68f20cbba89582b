use bzip2::{Action, Compress, Compression, Status};

use super::{
    BlockCompressor, Bzip2Options, CompressStatus, CompressionBuffer, CompressionBufferMut,
};
use crate::{Error, Result};

const NAME: &str = "bzip2";

pub struct Bzip2Compressor {
    stream: Option<Compress>,
    finished: bool,
}

impl Bzip2Compressor {
    pub fn new(options: &Bzip2Options) -> Self {
        Self {
            stream: Some(Compress::new(
                Compression::new(options.block_size()),
                options.work_factor(),
            )),
            finished: false,
        }
    }
}

impl BlockCompressor for Bzip2Compressor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compress(
        &mut self,
        input: &mut CompressionBuffer<'_>,
        output: &mut CompressionBufferMut<'_>,
    ) -> Result<CompressStatus> {
        let stream = self.stream.as_mut().ok_or(Error::Disposed)?;
        if self.finished {
            return Err(Error::codec(NAME, "stream already finished"));
        }

        while !input.is_empty() {
            if output.is_full() {
                return Ok(CompressStatus::More);
            }

            let before_in = stream.total_in();
            let before_out = stream.total_out();
            let status = stream
                .compress(input.remaining(), output.spare(), Action::Run)
                .map_err(|err| Error::codec(NAME, err))?;
            input.advance((stream.total_in() - before_in) as usize);
            output.advance((stream.total_out() - before_out) as usize);

            match status {
                Status::RunOk => {}
                Status::MemNeeded => return Ok(CompressStatus::More),
                other => {
                    return Err(Error::codec(NAME, format!("unexpected status {other:?}")));
                }
            }
        }
        Ok(CompressStatus::Complete)
    }

    fn flush(&mut self, output: &mut CompressionBufferMut<'_>) -> Result<CompressStatus> {
        let stream = self.stream.as_mut().ok_or(Error::Disposed)?;
        if self.finished {
            return Ok(CompressStatus::Complete);
        }

        while !output.is_full() {
            let before_out = stream.total_out();
            let status = stream
                .compress(&[], output.spare(), Action::Finish)
                .map_err(|err| Error::codec(NAME, err))?;
            output.advance((stream.total_out() - before_out) as usize);

            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    return Ok(CompressStatus::Complete);
                }
                Status::FinishOk => {}
                Status::MemNeeded => return Ok(CompressStatus::More),
                other => {
                    return Err(Error::codec(NAME, format!("unexpected status {other:?}")));
                }
            }
        }
        Ok(CompressStatus::More)
    }

    fn cleanup(&mut self) {
        self.stream = None;
    }
}
