//! The trailing footer which locates the offset index.
//!
//! A closed archive ends with the raw offset index, one little-endian `u64`
//! per record, immediately followed by a fixed 40-byte [`Footer`]:
//!
//! ```text
//! | tar records | tar trailer | index: count x u64 LE | footer (40 bytes) |
//!                             ^ index_start                             ^ stream_len
//! ```
//!
//! An archive whose tail does not carry [`Footer::MAGIC`] simply has no
//! index. That is the normal state of legacy archives, not an error.
use std::{fmt, ops::Range};

use positioned_io::ReadAt;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, little_endian as le};

/// The size of the encoded [`Footer`] in bytes.
pub const FOOTER_SIZE: u64 = size_of::<Footer>() as u64;

/// The size of each offset entry in the index.
pub const INDEX_ENTRY_SIZE: u64 = size_of::<le::U64>() as u64;

/// The fixed-size trailer of an indexed archive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Footer {
    /// The footer magic that should match [`Footer::MAGIC`].
    pub magic: [u8; 8],
    /// The offset of the first index entry.
    pub index_start: le::U64,
    /// The number of index entries, which is also the number of records.
    pub index_count: le::U64,
    /// MD5 digest of the raw index bytes.
    pub checksum: [u8; 16],
}

const _: () = assert!(FOOTER_SIZE == 40);

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("magic", &format_args!("b\"{}\"", self.magic.escape_ascii()))
            .field("index_start", &self.index_start.get())
            .field("index_count", &self.index_count.get())
            .field("checksum", &format_args!("{:02x?}", self.checksum))
            .finish()
    }
}

impl Footer {
    /// The expected magic.
    pub const MAGIC: [u8; 8] = *b"TARINDEX";

    #[must_use]
    pub fn new(index_start: u64, index_count: u64, checksum: [u8; 16]) -> Self {
        Self {
            magic: Self::MAGIC,
            index_start: index_start.into(),
            index_count: index_count.into(),
            checksum,
        }
    }

    /// Encode into the on-disk representation.
    #[must_use]
    pub fn encode(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut out = [0u8; FOOTER_SIZE as usize];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Decode the footer from the tail of an archive.
    ///
    /// Only the last [`FOOTER_SIZE`] bytes of `tail` are examined. Returns
    /// `None` if `tail` is too short or the magic does not match.
    #[must_use]
    pub fn decode(tail: &[u8]) -> Option<Self> {
        let start = tail.len().checked_sub(FOOTER_SIZE as usize)?;
        Self::read_from_bytes(&tail[start..])
            .ok()
            .filter(|footer| footer.magic == Self::MAGIC)
    }

    /// Read the footer at the end of a stream of `stream_len` bytes.
    pub fn read_from<R: ReadAt + ?Sized>(rdr: &R, stream_len: u64) -> std::io::Result<Option<Self>> {
        let Some(start) = stream_len.checked_sub(FOOTER_SIZE) else {
            return Ok(None);
        };
        let mut footer = Self::new_zeroed();
        rdr.read_exact_at(start, footer.as_mut_bytes())?;
        Ok(Some(footer).filter(|footer| footer.magic == Self::MAGIC))
    }

    /// The byte range of the index, if the footer agrees with the stream length.
    ///
    /// The index must end exactly where the footer begins.
    #[must_use]
    pub fn index_range(&self, stream_len: u64) -> Option<Range<u64>> {
        let start = self.index_start.get();
        let end = self
            .index_count
            .get()
            .checked_mul(INDEX_ENTRY_SIZE)?
            .checked_add(start)?;
        (Some(end) == stream_len.checked_sub(FOOTER_SIZE)).then_some(start..end)
    }

    /// Check the stored checksum against raw index bytes.
    #[must_use]
    pub fn validate_checksum(&self, index_bytes: &[u8]) -> bool {
        index_checksum(index_bytes) == self.checksum
    }
}

/// Calculate the MD5 checksum of raw index bytes.
#[must_use]
pub fn index_checksum(index_bytes: &[u8]) -> [u8; 16] {
    md5::compute(index_bytes).0
}
