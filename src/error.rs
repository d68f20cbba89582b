use std::io;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A name or path that cannot be represented in the archive.
    #[error("cannot archive {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("{field} value {value} does not fit in a {width}-byte header field")]
    FieldOverflow {
        field: &'static str,
        value: i128,
        width: usize,
    },

    #[error("invalid {codec} options: {message}")]
    Options {
        codec: &'static str,
        message: String,
    },

    #[error("{codec} compressor failed: {message}")]
    Codec {
        codec: &'static str,
        message: String,
    },

    /// I/O failure while reading a source file.
    #[error("failed to archive {}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(io::Error),

    #[error("stream is closed")]
    Disposed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Pipeline(String),
}

impl Error {
    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(codec: &'static str, message: impl ToString) -> Self {
        Self::Codec {
            codec,
            message: message.to_string(),
        }
    }

    pub(crate) fn options(codec: &'static str, message: impl Into<String>) -> Self {
        Self::Options {
            codec,
            message: message.into(),
        }
    }

    pub(crate) fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Format { .. } | Self::FieldOverflow { .. } | Self::Options { .. } => {
                io::ErrorKind::InvalidInput
            }
            Self::Disposed => io::ErrorKind::BrokenPipe,
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::Io(err) => err.kind(),
            Self::Source { source, .. } => source.kind(),
            Self::Codec { .. } | Self::Pipeline(_) => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Unwrap errors that already crossed a `Write`/`Read` boundary.
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }
            return Self::Pipeline("unrecoverable wrapped error".to_string());
        }
        Self::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_round_trip_keeps_variant() {
        let io_err: io::Error = Error::Disposed.into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(Error::from(io_err), Error::Disposed));
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        match err {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn source_errors_name_the_path() {
        let err = Error::Source {
            path: PathBuf::from("/srv/data.bin"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "failed to archive /srv/data.bin");
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
    }
}
