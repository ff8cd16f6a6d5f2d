use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Not enough free space (insert) or buffered data (remove) right now.
    /// Retryable, typically after waiting on the matching semaphore.
    NotReady,
    /// The item set can never fit in this queue's capacity. Not retryable.
    TooSmall,
    /// Auxiliary shared-memory allocation failed.
    Oom,
    /// Invariant violation or detected corruption. The queue and both of its
    /// endpoints must be considered unusable once this is returned.
    Fatal(&'static str),
    Io(std::io::Error),
    Unsupported(&'static str),
}

impl Error {
    /// True for failures a caller may retry, e.g. through the blocking
    /// insert/remove variants. Everything except `NotReady` is permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotReady => write!(f, "queue not ready"),
            Error::TooSmall => write!(f, "queue too small for item set"),
            Error::Oom => write!(f, "shared memory allocation failed"),
            Error::Fatal(msg) => write!(f, "fatal queue error: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
