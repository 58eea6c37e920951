use std::fmt;

use crate::tar;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from opening or reading an archive.
///
/// Use [`Error::kind`] to distinguish recoverable conditions.
pub struct Error(Box<ErrorInner>);

/// The category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The underlying reader failed.
    Io,
    /// The archive has no footer. Readers recover by rescanning.
    NoIndex,
    /// The footer or the index it points to is inconsistent.
    CorruptIndex,
    /// A record ordinal beyond the record count was requested.
    OutOfRange,
    /// A record header could not be parsed where one was expected.
    MalformedRecord,
    /// A configured size limit was exceeded.
    Limit,
    /// The archive handle was already released.
    Closed,
}

#[derive(Debug)]
pub(crate) enum ErrorInner {
    NoIndex,
    CorruptIndex(String),
    OutOfRange { index: u64, len: u64 },
    Record(String, tar::Error),
    Limit(String),
    Closed,
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
            ErrorInner::NoIndex => f.pad("archive has no index footer"),
            ErrorInner::CorruptIndex(msg) => write!(f, "corrupt index: {msg}"),
            ErrorInner::OutOfRange { index, len } => {
                write!(f, "record {index} is out of range for {len} records")
            }
            ErrorInner::Record(msg, err) => write!(f, "{msg}: {err}"),
            ErrorInner::Limit(msg) => write!(f, "{msg}"),
            ErrorInner::Closed => f.pad("archive is closed"),
            ErrorInner::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Record(_, err) => Some(err),
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
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInner::NoIndex => ErrorKind::NoIndex,
            ErrorInner::CorruptIndex(_) => ErrorKind::CorruptIndex,
            ErrorInner::OutOfRange { .. } => ErrorKind::OutOfRange,
            ErrorInner::Record(_, err) if err.is_io() => ErrorKind::Io,
            ErrorInner::Record(_, err) if err.is_limit() => ErrorKind::Limit,
            ErrorInner::Record(..) => ErrorKind::MalformedRecord,
            ErrorInner::Limit(_) => ErrorKind::Limit,
            ErrorInner::Closed => ErrorKind::Closed,
            ErrorInner::Io(_) => ErrorKind::Io,
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T, tar::Error> {
    #[inline]
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(ErrorInner::Record(msg.to_string(), err).into()),
        }
    }
}
