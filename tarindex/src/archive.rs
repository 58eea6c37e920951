//! The high-level interface for reading records from an archive.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    fs::File,
    num::NonZero,
    path::Path,
};

use bstr::BStr;
use positioned_io::{ReadAt, Size};

use crate::{
    Error, ErrorKind, Result,
    error::{ErrorInner, ResultExt},
    index::{BufferedIndex, load_index, scan_records},
    tar::{RecordHeader, RecordReader},
};

/// How [`Archive`] locates records when it is opened.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum IndexStrategy {
    /// Page in the embedded index on demand, without verifying its checksum.
    ///
    /// Opening costs a single footer read regardless of the archive size.
    #[default]
    Buffered,
    /// Load the whole embedded index and verify its checksum on open.
    Verified,
    /// Ignore any embedded index and scan every record header on open.
    Scan,
}

/// The index an opened [`Archive`] ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSource {
    /// The embedded index, paged in on demand.
    Buffered,
    /// The embedded index, fully loaded and verified.
    Verified,
    /// Record headers found by scanning the container.
    Scanned,
}

#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serialize",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct Config {
    index_strategy: IndexStrategy,
    index_block_size: NonZero<usize>,
    fallback_on_corrupt_index: bool,
    index_size_limit: usize,
    payload_size_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_strategy: IndexStrategy::default(),
            // 8KiB per index block.
            index_block_size: NonZero::new(1024).expect("1024 is non-zero"),
            fallback_on_corrupt_index: false,
            // Some arbitrarily chosen numbers.
            index_size_limit: 64 << 20,
            payload_size_limit: 1 << 30,
        }
    }
}

impl Config {
    pub fn index_strategy(mut self, strategy: IndexStrategy) -> Self {
        self.index_strategy = strategy;
        self
    }

    /// The number of offsets per block for [`IndexStrategy::Buffered`].
    pub fn index_block_size(mut self, entries: NonZero<usize>) -> Self {
        self.index_block_size = entries;
        self
    }

    /// Whether to rescan records when the embedded index is found corrupt,
    /// instead of failing to open.
    pub fn fallback_on_corrupt_index(mut self, fallback: bool) -> Self {
        self.fallback_on_corrupt_index = fallback;
        self
    }

    /// The maximum raw index size in bytes for [`IndexStrategy::Verified`].
    pub fn index_size_limit(mut self, limit: usize) -> Self {
        self.index_size_limit = limit;
        self
    }

    pub fn payload_size_limit(mut self, limit: usize) -> Self {
        self.payload_size_limit = limit;
        self
    }
}

/// A record location, parsed at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    /// The offset of the record header.
    offset: u64,
    header: Option<RecordHeader>,
}

impl Slot {
    fn unresolved(offset: u64) -> Self {
        Self {
            offset,
            header: None,
        }
    }

    fn resolved(header: RecordHeader) -> Self {
        Self {
            offset: header.offset(),
            header: Some(header),
        }
    }

    fn resolve<R: ReadAt + ?Sized>(
        &mut self,
        rdr: &RecordReader<R>,
        i: u64,
    ) -> Result<&RecordHeader> {
        let offset = self.offset;
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                trace!("record {i}: parsing header at {offset}");
                rdr.read_header_at(offset)
                    .context(format_args!("failed to parse header of record {i} at {offset}"))?
            }
        };
        Ok(self.header.insert(header))
    }
}

#[derive(Debug)]
enum Slots {
    /// Slots are created on first touch, from offsets of the paged index.
    Paged {
        index: BufferedIndex,
        slots: HashMap<u64, Slot>,
    },
    Dense(Vec<Slot>),
}

/// A reader for an indexed tar archive.
///
/// Records are addressed by their 0-based insertion ordinal. Each record
/// header is parsed on first access and memoized, so later reads of the
/// same record only read its payload.
///
/// An `Archive` exclusively owns its reader and is not meant to be shared
/// across threads without external synchronization. Any number of `Archive`s
/// may read the same finalized archive file independently.
pub struct Archive<R> {
    slots: Slots,
    len: u64,
    source: IndexSource,
    payload_size_limit: usize,

    rdr: Option<RecordReader<R>>,
}

impl<R> fmt::Debug for Archive<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("len", &self.len)
            .field("source", &self.source)
            .field("payload_size_limit", &self.payload_size_limit)
            .field("closed", &self.rdr.is_none())
            .finish_non_exhaustive()
    }
}

impl Archive<File> {
    /// Open an archive file with the default [`Config`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, &Config::default())
    }

    /// Same as [`Archive::open`] but with a non-default [`Config`].
    pub fn open_with_config(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        Self::new_with_config(File::open(path)?, config)
    }
}

impl<R: ReadAt + Size> Archive<R> {
    /// Load an archive from a random access stream, typically a [`std::fs::File`].
    ///
    /// Do not use [`BufReader`][std::io::BufReader]. All reads are positioned
    /// and header lookups are already memoized.
    pub fn new(rdr: R) -> Result<Self> {
        Self::new_with_config(rdr, &Config::default())
    }

    /// Same as [`Archive::new`] but with a non-default [`Config`].
    pub fn new_with_config(rdr: R, config: &Config) -> Result<Self> {
        trace_time!("open archive");

        let rdr = RecordReader::new(rdr);
        let embedded = match config.index_strategy {
            IndexStrategy::Buffered => BufferedIndex::open(rdr.get_ref(), config.index_block_size)
                .map(|index| {
                    let len = index.len();
                    let slots = Slots::Paged {
                        index,
                        slots: HashMap::new(),
                    };
                    (slots, len, IndexSource::Buffered)
                }),
            IndexStrategy::Verified => load_index(rdr.get_ref(), config.index_size_limit)
                .map(|offsets| {
                    let len = offsets.len() as u64;
                    let slots = Slots::Dense(offsets.into_iter().map(Slot::unresolved).collect());
                    (slots, len, IndexSource::Verified)
                }),
            IndexStrategy::Scan => Err(ErrorInner::NoIndex.into()),
        };

        let (slots, len, source) = match embedded {
            Ok(ret) => ret,
            Err(err) => {
                if config.index_strategy != IndexStrategy::Scan {
                    Self::check_fallback(err, config)?;
                }
                let headers = scan_records(&rdr)?;
                let len = headers.len() as u64;
                let slots = Slots::Dense(headers.into_iter().map(Slot::resolved).collect());
                (slots, len, IndexSource::Scanned)
            }
        };
        debug!("opened archive of {len} records using {source:?} index");

        Ok(Self {
            slots,
            len,
            source,
            payload_size_limit: config.payload_size_limit,
            rdr: Some(rdr),
        })
    }

    /// Decide whether a failure to use the embedded index can be recovered by scanning.
    fn check_fallback(err: Error, config: &Config) -> Result<()> {
        match err.kind() {
            ErrorKind::NoIndex => {
                info!("{err}, falling back to scanning");
                Ok(())
            }
            ErrorKind::CorruptIndex if config.fallback_on_corrupt_index => {
                warn!("{err}, falling back to scanning");
                Ok(())
            }
            _ => Err(err),
        }
    }
}

impl<R: ReadAt> Archive<R> {
    /// The number of records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The index this archive was opened with.
    #[inline]
    #[must_use]
    pub fn index_source(&self) -> IndexSource {
        self.source
    }

    /// Resolve the slot of record `i`, creating it first if necessary.
    fn resolve(&mut self, i: u64) -> Result<(&RecordReader<R>, &RecordHeader)> {
        if i >= self.len {
            bail!(ErrorInner::OutOfRange {
                index: i,
                len: self.len,
            });
        }
        let rdr = self.rdr.as_ref().ok_or(ErrorInner::Closed)?;
        let slot = match &mut self.slots {
            Slots::Paged { index, slots } => match slots.entry(i) {
                Entry::Occupied(ent) => ent.into_mut(),
                Entry::Vacant(ent) => ent.insert(Slot::unresolved(index.get(rdr.get_ref(), i)?)),
            },
            // `len` is the length of the vector here, so `i` fits `usize`.
            Slots::Dense(slots) => &mut slots[i as usize],
        };
        Ok((rdr, slot.resolve(rdr, i)?))
    }

    /// Get the header of record `i`, parsing it on first access.
    pub fn header(&mut self, i: u64) -> Result<&RecordHeader> {
        Ok(self.resolve(i)?.1)
    }

    /// Get the name of record `i`.
    pub fn name(&mut self, i: u64) -> Result<&BStr> {
        Ok(self.header(i)?.name())
    }

    /// Read the payload of record `i`.
    pub fn read(&mut self, i: u64) -> Result<Vec<u8>> {
        let limit = self.payload_size_limit;
        let (rdr, header) = self.resolve(i)?;
        rdr.read_payload(header, limit)
            .context(format_args!("failed to read payload of record {i}"))
    }

    /// Release the underlying reader. Later reads fail with [`ErrorKind::Closed`].
    ///
    /// Calling it more than once is a no-op.
    pub fn close(&mut self) {
        if self.rdr.take().is_some() {
            trace!("archive closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.rdr.is_none()
    }
}

impl<R> Archive<R> {
    /// Get a reference to the underlying reader, unless closed.
    pub fn get_ref(&self) -> Option<&R> {
        self.rdr.as_ref().map(RecordReader::get_ref)
    }

    /// Retrieve the ownership of the underlying reader, unless closed.
    pub fn into_inner(self) -> Option<R> {
        self.rdr.map(RecordReader::into_inner)
    }
}

#[cfg(test)]
mod tests;
