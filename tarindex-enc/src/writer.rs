use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use tarindex::footer::{Footer, index_checksum};
use zerocopy::{IntoBytes, little_endian as le};

use crate::{ErrorInner, ErrorKind, Result, tar::Builder};

/// An append-only writer of indexed archives.
///
/// Every [`Writer::write`] appends one record and remembers the offset it
/// starts at. [`Writer::close`] finalizes the tar container, then writes the
/// offset index and the [`Footer`] locating it. Dropping an unclosed writer
/// closes it, logging any error since it cannot be returned.
///
/// Once writing to the sink fails, the bytes already written may end in a
/// partial record. The writer then refuses further records, and closing it
/// leaves out the index and footer, so readers fall back to scanning the
/// complete records.
///
/// A `Writer` exclusively owns its sink. Concurrent appends from multiple
/// threads need external synchronization.
#[derive(Debug)]
pub struct Writer<W: Write> {
    builder: Builder<W>,
    index: Vec<u64>,
    closed: bool,
    failed: bool,
}

impl Writer<BufWriter<File>> {
    /// Create a new archive file at `path`, truncating any existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::create(path)?;
        log::debug!("creating archive at {}", path.display());
        Ok(Self::new(BufWriter::new(f)))
    }
}

impl<W: Write> Writer<W> {
    /// Start a new archive at the beginning of `w`.
    pub fn new(w: W) -> Self {
        Self {
            builder: Builder::new(w),
            index: Vec::new(),
            closed: false,
            failed: false,
        }
    }

    /// Get a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        self.builder.get_ref()
    }

    /// Get a mutable reference to the underlying writer.
    ///
    /// Writing through it corrupts the archive.
    pub fn get_mut(&mut self) -> &mut W {
        self.builder.get_mut()
    }

    /// The number of records written so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.index.len() as u64
    }

    /// Whether no record has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The offset of each record written so far, in order.
    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.index
    }

    /// Whether [`Writer::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append a record and return its ordinal.
    ///
    /// `name` must be non-empty and must not contain NUL bytes. A rejected
    /// name leaves the archive untouched. Any other error fails the writer,
    /// and later calls return [`ErrorKind::Failed`].
    pub fn write(&mut self, name: impl AsRef<[u8]>, data: &[u8]) -> Result<u64> {
        if self.closed {
            bail!(ErrorInner::Closed);
        }
        if self.failed {
            bail!(ErrorInner::Failed);
        }
        let ordinal = self.len();
        let offset = match self.builder.append(name.as_ref(), data) {
            Ok(offset) => offset,
            Err(err) => {
                // Names are validated before anything is written.
                self.failed = err.kind() != ErrorKind::InvalidName;
                return Err(err);
            }
        };
        debug_assert!(self.index.last().is_none_or(|&last| last < offset));
        self.index.push(offset);
        log::trace!("record {ordinal} written at {offset}");
        Ok(ordinal)
    }

    /// Finalize the archive and flush the underlying writer.
    ///
    /// If an earlier [`Writer::write`] failed, only the flush happens and
    /// [`ErrorKind::Failed`] is returned.
    /// Calling it again after it returned, successfully or not, is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        // Never retried, even if anything below fails.
        self.closed = true;

        if self.failed {
            log::warn!(
                "not indexing {} records after a failed write",
                self.index.len(),
            );
            self.builder.get_mut().flush()?;
            bail!(ErrorInner::Failed);
        }

        self.builder.finish()?;
        let index_start = self.builder.position();
        let index = self
            .index
            .iter()
            .map(|&offset| le::U64::new(offset))
            .collect::<Vec<_>>();
        let index_bytes = index.as_bytes();
        let footer = Footer::new(index_start, self.len(), index_checksum(index_bytes));

        let w = self.builder.get_mut();
        w.write_all(index_bytes)?;
        w.write_all(&footer.encode())?;
        w.flush()?;

        log::debug!(
            "closed archive of {} records, index at {index_start}",
            self.index.len(),
        );
        Ok(())
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("failed to close archive on drop: {err}");
        }
    }
}
