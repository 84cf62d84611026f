use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Lzma2Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("buffer pool capacity exceeded (requested {requested} bytes, limit {limit} bytes)")]
    Capacity { requested: usize, limit: usize },
    #[error("stream closed")]
    Cancelled,
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("worker failure: {0}")]
    Worker(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Lzma2Error>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Lzma2Error {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when this error, or the error it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Context { source, .. } => source.is_cancelled(),
            Self::Io(err) => err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<Lzma2Error>())
                .is_some_and(Lzma2Error::is_cancelled),
            _ => false,
        }
    }

    /// Produces an equivalent error for a second observer of the same failure.
    ///
    /// Stream failures are recorded once and reported to every blocked caller,
    /// so the stored error has to be reproducible without `Clone` on `io::Error`.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
            Self::Capacity { requested, limit } => Self::Capacity {
                requested: *requested,
                limit: *limit,
            },
            Self::Cancelled => Self::Cancelled,
            Self::IllegalState(message) => Self::IllegalState(message),
            Self::InvalidOptions(message) => Self::InvalidOptions(message.clone()),
            Self::Worker(message) => Self::Worker(message.clone()),
            Self::Context { context, source } => Self::Context {
                context: context.clone(),
                source: Box::new(source.duplicate()),
            },
            Self::Other(err) => Self::Other(anyhow::anyhow!("{err:#}")),
        }
    }
}

impl From<Lzma2Error> for io::Error {
    fn from(err: Lzma2Error) -> Self {
        match err {
            Lzma2Error::Io(inner) => inner,
            Lzma2Error::Cancelled => io::Error::new(io::ErrorKind::BrokenPipe, err),
            Lzma2Error::IllegalState(_) | Lzma2Error::InvalidOptions(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            Lzma2Error::Capacity { .. } => io::Error::new(io::ErrorKind::OutOfMemory, err),
            other => io::Error::other(other),
        }
    }
}
