use std::fmt;

/// A specialized [`Result`][std::result::Result] for writing archives.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from writing an archive.
pub struct Error(Box<ErrorInner>);

/// The category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The underlying writer failed.
    Io,
    /// The record name cannot be stored.
    InvalidName,
    /// The archive was already closed.
    Closed,
    /// An earlier write failed, so the archive takes no more records.
    Failed,
    /// The archive grows beyond what the format can address.
    Limit,
}

#[derive(Debug)]
pub(crate) enum ErrorInner {
    Limit(&'static str),
    InvalidName(&'static str),
    Closed,
    Failed,

    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Limit(msg) => write!(f, "{msg}"),
            ErrorInner::InvalidName(msg) => write!(f, "invalid record name: {msg}"),
            ErrorInner::Closed => f.pad("archive is closed"),
            ErrorInner::Failed => f.pad("archive writer failed earlier"),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl Error {
    /// The category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInner::Limit(_) => ErrorKind::Limit,
            ErrorInner::InvalidName(_) => ErrorKind::InvalidName,
            ErrorInner::Closed => ErrorKind::Closed,
            ErrorInner::Failed => ErrorKind::Failed,
            ErrorInner::Io(_) => ErrorKind::Io,
        }
    }
}
