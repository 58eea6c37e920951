//! The low-level module for accessing records in a tar container.
//!
//! Records are stored as regular-file entries of a POSIX ustar archive: a
//! 512-byte [`Header`] followed by the payload, zero-padded to the next
//! 512-byte boundary. Names longer than the 100-byte header field are carried
//! by a preceding GNU `././@LongLink` entry. Two zero blocks mark the end of
//! the container.
//!
//! See [`RecordReader`] for APIs to read records. Functions returning a
//! [`RecordHeader`] always validate the raw header checksum and magic first.
//!
//! See also:
//! [POSIX ustar Interchange Format](https://pubs.opengroup.org/onlinepubs/9699919799/utilities/pax.html#tag_20_92_13_06)
use std::{fmt, io::ErrorKind, iter::FusedIterator};

use bstr::{BStr, BString, ByteSlice};
use positioned_io::ReadAt;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

type Result<T> = std::result::Result<T, Error>;

/// The size of a tar block, which is also the size of a [`Header`].
pub const BLOCK_SIZE: u64 = 512;

/// The length of the end-of-archive marker, two zero blocks.
pub const TRAILER_SIZE: u64 = 2 * BLOCK_SIZE;

/// The limit of a GNU long name payload.
const LONG_NAME_LIMIT: u64 = 64 << 10;

/// An error raised from reading or validating tar headers and payloads.
pub struct Error(Box<ErrorInner>);

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
#[non_exhaustive]
enum ErrorInner {
    // Header.
    InvalidMagic([u8; 6]),
    ChecksumMismatch { expect: u64, got: u64 },
    InvalidNumber(&'static str),
    UnsupportedType(u8),
    DanglingLongName,
    OffsetOverflow,

    // Layout.
    EndOfArchive(u64),
    Truncated(u64),

    // Payload.
    PayloadTooLong { limit: usize, got: u64 },

    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::InvalidMagic(magic) => {
                write!(f, "invalid tar magic: b\"{}\"", magic.escape_ascii())
            }
            ErrorInner::ChecksumMismatch { expect, got } => {
                write!(f, "tar header checksum mismatch, expect {expect} but got {got}")
            }
            ErrorInner::InvalidNumber(field) => write!(f, "invalid numeric field `{field}`"),
            ErrorInner::UnsupportedType(typ) => {
                write!(f, "unsupported entry type {:?}", char::from(*typ))
            }
            ErrorInner::DanglingLongName => f.pad("long name entry is not followed by a record"),
            ErrorInner::OffsetOverflow => f.pad("record offset overflow"),
            ErrorInner::EndOfArchive(offset) => {
                write!(f, "unexpected end-of-archive marker at {offset}")
            }
            ErrorInner::Truncated(offset) => write!(f, "archive is truncated at {offset}"),
            ErrorInner::PayloadTooLong { limit, got } => {
                write!(
                    f,
                    "record payload has {got} bytes, exceeding the limit of {limit} bytes"
                )
            }
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

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl Error {
    /// Whether this error comes from the underlying reader rather than the archive content.
    pub(crate) fn is_io(&self) -> bool {
        matches!(&*self.0, ErrorInner::Io(_))
    }

    /// Whether the stream ends in the middle of an entry.
    pub(crate) fn is_truncated(&self) -> bool {
        matches!(&*self.0, ErrorInner::Truncated(_))
    }

    /// Whether this error is a configured size limit being hit.
    pub(crate) fn is_limit(&self) -> bool {
        matches!(&*self.0, ErrorInner::PayloadTooLong { .. })
    }
}

/// The raw 512-byte ustar header.
#[derive(Clone, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub checksum: [u8; 8],
    pub typeflag: u8,
    pub linkname: [u8; 100],
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub uname: [u8; 32],
    pub gname: [u8; 32],
    pub devmajor: [u8; 8],
    pub devminor: [u8; 8],
    pub prefix: [u8; 155],
    pub pad: [u8; 12],
}

const _: () = assert!(size_of::<Header>() as u64 == BLOCK_SIZE);

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("name", &field_str(&self.name).as_bstr())
            .field("size", &parse_number(&self.size).ok())
            .field("typeflag", &char::from(self.typeflag))
            .field("magic", &format_args!("b\"{}\"", self.magic.escape_ascii()))
            .field("version", &format_args!("b\"{}\"", self.version.escape_ascii()))
            .field("prefix", &field_str(&self.prefix).as_bstr())
            .finish_non_exhaustive()
    }
}

impl Header {
    /// The POSIX ustar magic.
    pub const MAGIC_USTAR: [u8; 6] = *b"ustar\0";
    /// The POSIX ustar version.
    pub const VERSION_USTAR: [u8; 2] = *b"00";
    /// The magic written by GNU tar in its own format.
    pub const MAGIC_GNU: [u8; 6] = *b"ustar ";
    /// The version written by GNU tar in its own format.
    pub const VERSION_GNU: [u8; 2] = *b" \0";

    /// A regular file entry.
    pub const TYPE_REGULAR: u8 = b'0';
    /// A regular file entry written by pre-POSIX tar.
    pub const TYPE_REGULAR_OLD: u8 = b'\0';
    /// A contiguous file entry, which readers treat as a regular file.
    pub const TYPE_CONTIGUOUS: u8 = b'7';
    /// A GNU long name entry. Its payload is the name of the next entry.
    pub const TYPE_GNU_LONG_NAME: u8 = b'L';

    /// The entry name used for GNU long name entries.
    pub const LONG_LINK_NAME: &'static [u8] = b"././@LongLink";

    /// Create a checksummed ustar header for an entry of `typeflag`.
    ///
    /// `name` is truncated to the 100-byte name field. The caller is
    /// responsible for emitting a long name entry first if it does not fit.
    /// All ownership and time fields are fixed, so equal inputs always
    /// produce byte-identical headers. Sizes beyond the octal range are
    /// stored in GNU base-256 encoding.
    #[must_use]
    pub fn new(typeflag: u8, name: &[u8], size: u64) -> Self {
        let mut header = Self::new_zeroed();
        let len = name.len().min(header.name.len());
        header.name[..len].copy_from_slice(&name[..len]);
        for (field, value) in [
            (&mut header.mode[..], 0o644),
            (&mut header.uid[..], 0),
            (&mut header.gid[..], 0),
            (&mut header.mtime[..], 0),
        ] {
            let fits = write_octal(field, value);
            debug_assert!(fits);
        }
        write_size(&mut header.size, size);
        header.typeflag = typeflag;
        header.magic = Self::MAGIC_USTAR;
        header.version = Self::VERSION_USTAR;
        header.update_checksum();
        header
    }

    /// Recalculate and store the header checksum.
    pub fn update_checksum(&mut self) {
        let sum = self.calculate_checksum();
        // Six octal digits, NUL, space. Matches what GNU tar writes.
        let (digits, tail) = self.checksum.split_at_mut(7);
        write_octal(digits, sum);
        tail[0] = b' ';
    }

    /// The unsigned sum of all header bytes, with the checksum field taken as spaces.
    #[must_use]
    pub fn calculate_checksum(&self) -> u64 {
        let bytes = self.as_bytes();
        let start = std::mem::offset_of!(Self, checksum);
        let end = start + self.checksum.len();
        let sum: u64 = bytes[..start]
            .iter()
            .chain(&bytes[end..])
            .map(|&b| u64::from(b))
            .sum();
        sum + u64::from(b' ') * self.checksum.len() as u64
    }

    /// Validate the magic and the header checksum.
    pub fn validate(&self) -> Result<()> {
        let is_ustar = self.magic == Self::MAGIC_USTAR && self.version == Self::VERSION_USTAR;
        let is_gnu = self.magic == Self::MAGIC_GNU && self.version == Self::VERSION_GNU;
        if !is_ustar && !is_gnu {
            bail!(ErrorInner::InvalidMagic(self.magic));
        }
        let expect =
            parse_number(&self.checksum).map_err(|()| ErrorInner::InvalidNumber("chksum"))?;
        let got = self.calculate_checksum();
        if expect != got {
            bail!(ErrorInner::ChecksumMismatch { expect, got });
        }
        Ok(())
    }

    /// Check if this is a zero block, which marks the end of the archive.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// Check if this header describes a regular file, which is what records are stored as.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        matches!(
            self.typeflag,
            Self::TYPE_REGULAR | Self::TYPE_REGULAR_OLD | Self::TYPE_CONTIGUOUS
        )
    }

    /// The payload size in bytes, in either octal or GNU base-256 encoding.
    pub fn entry_size(&self) -> Result<u64> {
        parse_number(&self.size).map_err(|()| ErrorInner::InvalidNumber("size").into())
    }

    /// The entry name stored in the header itself, joined with the ustar prefix if any.
    #[must_use]
    pub fn entry_name(&self) -> BString {
        let name = field_str(&self.name);
        let prefix = field_str(&self.prefix);
        if self.magic != Self::MAGIC_USTAR || prefix.is_empty() {
            return name.into();
        }
        let mut full = BString::from(prefix);
        full.push(b'/');
        full.extend_from_slice(name);
        full
    }
}

/// Trim a NUL-terminated header field.
fn field_str(field: &[u8]) -> &[u8] {
    let end = field.find_byte(0).unwrap_or(field.len());
    &field[..end]
}

/// Parse a numeric header field, either space/NUL terminated octal or GNU base-256.
fn parse_number(field: &[u8]) -> std::result::Result<u64, ()> {
    if let Some((&first, rest)) = field.split_first() {
        if first & 0x80 != 0 {
            // Base-256, big endian. Negative values are not meaningful here.
            if first & 0x40 != 0 {
                return Err(());
            }
            let mut value = u64::from(first & 0x3F);
            for &b in rest {
                value = value.checked_mul(256).ok_or(())? | u64::from(b);
            }
            return Ok(value);
        }
    }

    let digits = field.trim_start_with(|c| c == ' ' || c == '\0');
    let end = digits
        .iter()
        .position(|&b| b == b' ' || b == 0)
        .unwrap_or(digits.len());
    digits[..end].iter().try_fold(0u64, |acc, &b| match b {
        b'0'..=b'7' => acc
            .checked_mul(8)
            .map(|acc| acc | u64::from(b - b'0'))
            .ok_or(()),
        _ => Err(()),
    })
}

/// Write `value` as zero-padded octal followed by a NUL.
///
/// Returns `false` if it does not fit.
fn write_octal(field: &mut [u8], mut value: u64) -> bool {
    let Some((last, digits)) = field.split_last_mut() else {
        return false;
    };
    *last = 0;
    for d in digits.iter_mut().rev() {
        *d = b'0' + (value & 7) as u8;
        value >>= 3;
    }
    value == 0
}

/// Write the size field, falling back to GNU base-256 when octal overflows.
fn write_size(field: &mut [u8; 12], value: u64) {
    if !write_octal(field, value) {
        field.fill(0);
        field[0] = 0x80;
        field[4..].copy_from_slice(&value.to_be_bytes());
    }
}

/// A parsed record header: where a record lives and what it is called.
///
/// `offset` is where the header chain of the record starts, including any
/// long name entry, which is the position a writer reports when appending.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordHeader {
    offset: u64,
    name: BString,
    payload_offset: u64,
    payload_size: u64,
}

impl RecordHeader {
    /// The offset of the first header block of this record.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The record name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &BStr {
        self.name.as_bstr()
    }

    /// The offset of the first payload byte.
    #[inline]
    #[must_use]
    pub fn payload_offset(&self) -> u64 {
        self.payload_offset
    }

    /// The payload length in bytes.
    #[inline]
    #[must_use]
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// The offset right after the padded payload, where the next entry starts.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        // Checked not to overflow when the header was parsed.
        self.payload_offset + padded(self.payload_size).unwrap_or(0)
    }
}

/// Round up to a whole number of blocks.
#[inline]
fn padded(size: u64) -> Option<u64> {
    size.checked_next_multiple_of(BLOCK_SIZE)
}

/// One step of walking the container.
#[derive(Debug)]
enum Entry {
    /// The end-of-archive zero block.
    End,
    Record(RecordHeader),
    /// A valid entry that is not a record, e.g. a directory or a PAX header.
    Other { typeflag: u8, next_offset: u64 },
}

/// The wrapper type for reading records from a random access reader.
///
/// The inner type should implement [`positioned_io::ReadAt`]. Typically,
/// [`std::fs::File`] should be used. Every method reads with positioned I/O,
/// so a shared reference is enough and no seek state is kept.
pub struct RecordReader<R: ?Sized> {
    rdr: R,
}

impl<R: fmt::Debug + ?Sized> fmt::Debug for RecordReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordReader")
            .field("rdr", &&self.rdr)
            .finish()
    }
}

impl<R> RecordReader<R> {
    /// Create a new record reader wrapping an existing random access stream,
    /// typically, [`std::fs::File`].
    pub fn new(rdr: R) -> Self {
        Self { rdr }
    }
}

impl<R: ?Sized> RecordReader<R> {
    /// Get a reference to the underlying reader.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &R {
        &self.rdr
    }

    /// Retrieve the ownership of the underlying reader.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> R
    where
        R: Sized,
    {
        self.rdr
    }
}

impl<R: ReadAt + ?Sized> RecordReader<R> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.rdr.read_exact_at(offset, buf) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                bail!(ErrorInner::Truncated(offset))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read a raw header block at `offset`, or `None` for a zero block.
    pub fn read_raw_header_at(&self, offset: u64) -> Result<Option<Header>> {
        let mut header = Header::new_zeroed();
        self.read_exact_at(offset, header.as_mut_bytes())?;
        if header.is_zero() {
            return Ok(None);
        }
        header.validate()?;
        Ok(Some(header))
    }

    fn read_entry_at(&self, offset: u64) -> Result<Entry> {
        let mut long_name = None;
        let mut header_offset = offset;
        loop {
            let Some(header) = self.read_raw_header_at(header_offset)? else {
                if long_name.is_some() {
                    bail!(ErrorInner::DanglingLongName);
                }
                return Ok(Entry::End);
            };
            let size = header.entry_size()?;
            let (payload_offset, next_offset) = header_offset
                .checked_add(BLOCK_SIZE)
                .and_then(|payload| Some((payload, payload.checked_add(padded(size)?)?)))
                .ok_or(ErrorInner::OffsetOverflow)?;

            if header.typeflag == Header::TYPE_GNU_LONG_NAME {
                if long_name.is_some() {
                    bail!(ErrorInner::DanglingLongName);
                }
                if size > LONG_NAME_LIMIT {
                    bail!(ErrorInner::PayloadTooLong {
                        limit: LONG_NAME_LIMIT as usize,
                        got: size,
                    });
                }
                let mut name = vec![0u8; size as usize];
                self.read_exact_at(payload_offset, &mut name)?;
                let len = name.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
                name.truncate(len);
                long_name = Some(BString::from(name));
                header_offset = next_offset;
                continue;
            }

            if !header.is_regular() {
                if long_name.is_some() {
                    bail!(ErrorInner::DanglingLongName);
                }
                return Ok(Entry::Other {
                    typeflag: header.typeflag,
                    next_offset,
                });
            }

            return Ok(Entry::Record(RecordHeader {
                offset,
                name: long_name.unwrap_or_else(|| header.entry_name()),
                payload_offset,
                payload_size: size,
            }));
        }
    }

    /// Read and parse the header chain of the record starting at `offset`.
    pub fn read_header_at(&self, offset: u64) -> Result<RecordHeader> {
        match self.read_entry_at(offset)? {
            Entry::Record(header) => Ok(header),
            Entry::End => Err(ErrorInner::EndOfArchive(offset).into()),
            Entry::Other { typeflag, .. } => Err(ErrorInner::UnsupportedType(typeflag).into()),
        }
    }

    /// Read the payload of a record into an owned `Vec<u8>`.
    ///
    /// The payload must be no longer than `payload_size_limit`, or an error
    /// will be emitted.
    pub fn read_payload(&self, header: &RecordHeader, payload_size_limit: usize) -> Result<Vec<u8>> {
        let size = header.payload_size;
        let Some(len) = usize::try_from(size)
            .ok()
            .filter(|&n| n <= payload_size_limit)
        else {
            bail!(ErrorInner::PayloadTooLong {
                limit: payload_size_limit,
                got: size,
            });
        };
        let mut buf = vec![0u8; len];
        self.read_exact_at(header.payload_offset, &mut buf)?;
        Ok(buf)
    }

    /// Iterate all records from the start of the container, in order.
    ///
    /// `stream_len` is the total size of the input reader `R`, which is
    /// typically the whole file size. Iteration ends at the end-of-archive
    /// marker, or cleanly at `stream_len` if the container was never
    /// finalized. A trailing entry cut short by `stream_len` ends iteration
    /// with a warning, keeping every complete record before it.
    /// Non-record entries are skipped.
    pub fn entries(&self, stream_len: u64) -> Entries<'_, R> {
        Entries {
            rdr: self,
            next_offset: 0,
            stream_len,
            done: false,
        }
    }
}

/// The iterator returned by [`RecordReader::entries`].
pub struct Entries<'a, R: ?Sized> {
    rdr: &'a RecordReader<R>,
    next_offset: u64,
    stream_len: u64,
    done: bool,
}

impl<R: ?Sized> fmt::Debug for Entries<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entries")
            .field("next_offset", &self.next_offset)
            .field("stream_len", &self.stream_len)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt + ?Sized> Iterator for Entries<'_, R> {
    type Item = Result<RecordHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.next_offset >= self.stream_len {
                trace!("no end-of-archive marker, stopping at {}", self.next_offset);
                self.done = true;
                break;
            }
            match self.rdr.read_entry_at(self.next_offset) {
                Ok(Entry::End) => self.done = true,
                Ok(Entry::Other {
                    typeflag,
                    next_offset,
                }) => {
                    trace!(
                        "skipping entry of type {:?} at {}",
                        char::from(typeflag),
                        self.next_offset,
                    );
                    self.next_offset = next_offset;
                }
                Ok(Entry::Record(header)) => {
                    let payload_end = header.payload_offset + header.payload_size;
                    if payload_end > self.stream_len {
                        warn!(
                            "record at {} is cut short at {}, dropping it",
                            self.next_offset, self.stream_len,
                        );
                        self.done = true;
                        break;
                    }
                    self.next_offset = header.next_offset();
                    return Some(Ok(header));
                }
                Err(err) if err.is_truncated() => {
                    warn!("{err}, dropping the partial entry at {}", self.next_offset);
                    self.done = true;
                    break;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

impl<R: ReadAt + ?Sized> FusedIterator for Entries<'_, R> {}
