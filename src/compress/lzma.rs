use xz2::stream::{Action, Check, MtStreamBuilder, Status, Stream};

use super::{BlockCompressor, CompressStatus, CompressionBuffer, CompressionBufferMut, XzOptions};
use crate::events::{LogLevel, LogSink};
use crate::{Error, Result};

const NAME: &str = "xz";

/// `.xz` container backend; multithreaded when the options ask for threads.
pub struct XzCompressor {
    stream: Option<Stream>,
    finished: bool,
}

impl XzCompressor {
    pub fn new(options: &XzOptions, log: &LogSink) -> Result<Self> {
        let stream = match options.threads() {
            Some(threads) => {
                let mut builder = MtStreamBuilder::new();
                builder
                    .threads(threads)
                    .preset(options.level())
                    .block_size(options.block_size())
                    .check(Check::Crc64);
                match builder.encoder() {
                    Ok(stream) => stream,
                    Err(err) => {
                        let message = format!(
                            "xz: multithreaded encoder unavailable ({err}), using one thread"
                        );
                        log(LogLevel::Warning, &message);
                        single_threaded(options)?
                    }
                }
            }
            None => single_threaded(options)?,
        };

        Ok(Self {
            stream: Some(stream),
            finished: false,
        })
    }
}

fn single_threaded(options: &XzOptions) -> Result<Stream> {
    Stream::new_easy_encoder(options.level(), Check::Crc64).map_err(|err| Error::codec(NAME, err))
}

impl BlockCompressor for XzCompressor {
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
                .process(input.remaining(), output.spare(), Action::Run)
                .map_err(|err| Error::codec(NAME, err))?;
            input.advance((stream.total_in() - before_in) as usize);
            output.advance((stream.total_out() - before_out) as usize);

            // liblzma reports "no progress possible" as MemNeeded.
            if status == Status::MemNeeded {
                return Ok(CompressStatus::More);
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
                .process(&[], output.spare(), Action::Finish)
                .map_err(|err| Error::codec(NAME, err))?;
            output.advance((stream.total_out() - before_out) as usize);

            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    return Ok(CompressStatus::Complete);
                }
                Status::MemNeeded => return Ok(CompressStatus::More),
                Status::Ok | Status::GetCheck => {}
            }
        }
        Ok(CompressStatus::More)
    }

    fn cleanup(&mut self) {
        self.stream = None;
    }
}
