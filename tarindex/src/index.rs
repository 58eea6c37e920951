//! Locating records: the paged [`BufferedIndex`], the verifying
//! [`load_index`], and the [`scan_records`] fallback.
//!
//! The first two read the offset index written at the end of an archive (see
//! [`crate::footer`]). They trade differently between open cost and trust:
//!
//! - [`BufferedIndex`] reads only the footer on open and pages index blocks in
//!   on first touch. Nothing is checksummed, so a damaged index shows up only
//!   later, as a malformed record at a bogus offset.
//! - [`load_index`] reads the whole index and checks it against the footer
//!   checksum before returning anything.
//!
//! [`scan_records`] is for archives without a footer at all. It walks every
//! tar header from the start of the file.
use std::{collections::HashMap, num::NonZero};

use positioned_io::{ReadAt, Size};
use zerocopy::{IntoBytes, little_endian as le};

use crate::{
    Result,
    error::{ErrorInner, ResultExt},
    footer::{FOOTER_SIZE, Footer, INDEX_ENTRY_SIZE},
    tar::{RecordHeader, RecordReader},
};

/// Get the total length of a stream.
pub(crate) fn stream_len<R: Size + ?Sized>(rdr: &R) -> Result<u64> {
    let len = rdr.size()?.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "cannot get the size of the archive reader",
        )
    })?;
    Ok(len)
}

/// Read the footer and validate its geometry against the stream length.
fn read_footer<R: ReadAt + ?Sized>(rdr: &R, stream_len: u64) -> Result<Footer> {
    let footer = Footer::read_from(rdr, stream_len)?.ok_or(ErrorInner::NoIndex)?;
    if footer.index_range(stream_len).is_none() {
        bail!(ErrorInner::CorruptIndex(format!(
            "{} entries at {} do not end at the footer, stream has {stream_len} bytes",
            footer.index_count.get(),
            footer.index_start.get(),
        )));
    }
    Ok(footer)
}

/// A paged view of the offset index of a finalized archive.
///
/// Index entries are read in blocks of `block_size` entries the first time an
/// entry in the block is touched. Loaded blocks are kept for the lifetime of
/// the index. There is no eviction, so repeated access over the whole archive
/// amortizes to a single pass over the index.
///
/// The index does not own a reader. Every loading method takes the reader of
/// the archive the index was opened on.
#[derive(Debug)]
pub struct BufferedIndex {
    footer: Footer,
    block_size: NonZero<usize>,
    blocks: HashMap<u64, Box<[u64]>>,
}

impl BufferedIndex {
    /// Open the index of an archive, reading only its footer.
    ///
    /// Fails with [`ErrorKind::NoIndex`][crate::ErrorKind::NoIndex] if the
    /// archive has no footer, or with
    /// [`ErrorKind::CorruptIndex`][crate::ErrorKind::CorruptIndex] if the
    /// footer does not agree with the archive size.
    pub fn open<R: ReadAt + Size + ?Sized>(rdr: &R, block_size: NonZero<usize>) -> Result<Self> {
        let stream_len = stream_len(rdr)?;
        let footer = read_footer(rdr, stream_len)?;
        debug!(
            "opened buffered index of {} records at {}",
            footer.index_count.get(),
            footer.index_start.get(),
        );
        Ok(Self {
            footer,
            block_size,
            blocks: HashMap::new(),
        })
    }

    /// The number of entries, which is also the number of records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.footer.index_count.get()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }

    #[inline]
    #[must_use]
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Indices of the blocks currently in memory, in ascending order.
    #[must_use]
    pub fn loaded_blocks(&self) -> Vec<u64> {
        let mut blocks = self.blocks.keys().copied().collect::<Vec<_>>();
        blocks.sort_unstable();
        blocks
    }

    /// Get the offset of record `i`, loading its block if necessary.
    pub fn get<R: ReadAt + ?Sized>(&mut self, rdr: &R, i: u64) -> Result<u64> {
        Ok(*self.entry_mut(rdr, i)?)
    }

    /// Overwrite the in-memory offset of record `i`, loading its block first.
    ///
    /// The archive itself is never modified.
    pub fn set<R: ReadAt + ?Sized>(&mut self, rdr: &R, i: u64, offset: u64) -> Result<()> {
        *self.entry_mut(rdr, i)? = offset;
        Ok(())
    }

    fn entry_mut<R: ReadAt + ?Sized>(&mut self, rdr: &R, i: u64) -> Result<&mut u64> {
        let len = self.len();
        if i >= len {
            bail!(ErrorInner::OutOfRange { index: i, len });
        }
        let block_size = self.block_size.get() as u64;
        let block_idx = i / block_size;
        let block_start = block_idx * block_size;

        let block = match self.blocks.entry(block_idx) {
            std::collections::hash_map::Entry::Occupied(ent) => {
                trace!("index block {block_idx}: cache hit");
                ent.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(ent) => {
                trace_time!("index block {block_idx}: cache miss");
                // Fits `usize` since it is no larger than `block_size`.
                let count = block_size.min(len - block_start) as usize;
                let mut buf = vec![le::U64::ZERO; count];
                // Cannot overflow, the whole index range is validated on open.
                let pos = self.footer.index_start.get() + block_start * INDEX_ENTRY_SIZE;
                rdr.read_exact_at(pos, buf.as_mut_bytes())?;
                ent.insert(buf.iter().map(|off| off.get()).collect())
            }
        };
        Ok(&mut block[(i - block_start) as usize])
    }
}

/// Read the whole offset index and verify it against the footer checksum.
///
/// Besides the checksum, offsets must be strictly increasing and lie before
/// the index itself. The raw index must not exceed `size_limit` bytes.
pub fn load_index<R: ReadAt + Size + ?Sized>(rdr: &R, size_limit: usize) -> Result<Vec<u64>> {
    trace_time!("load and verify offset index");

    let stream_len = stream_len(rdr)?;
    let footer = read_footer(rdr, stream_len)?;
    let index_start = footer.index_start.get();
    let count = footer.index_count.get();

    // `read_footer` guarantees it does not overflow.
    let size = count * INDEX_ENTRY_SIZE;
    let Some(count) = usize::try_from(count)
        .ok()
        .filter(|_| size <= size_limit as u64)
    else {
        bail!(ErrorInner::Limit(format!(
            "offset index has {size} bytes, exceeding the limit of {size_limit} bytes"
        )));
    };

    let mut buf = vec![le::U64::ZERO; count];
    rdr.read_exact_at(index_start, buf.as_mut_bytes())?;
    if !footer.validate_checksum(buf.as_bytes()) {
        bail!(ErrorInner::CorruptIndex("checksum mismatch".into()));
    }

    let offsets = buf.iter().map(|off| off.get()).collect::<Vec<_>>();
    if let Some(pos) = offsets.windows(2).position(|w| w[0] >= w[1]) {
        bail!(ErrorInner::CorruptIndex(format!(
            "offsets are not increasing at record {}",
            pos + 1
        )));
    }
    if offsets.last().is_some_and(|&last| last >= index_start) {
        bail!(ErrorInner::CorruptIndex(
            "offsets point past the start of the index".into()
        ));
    }

    debug!(
        "verified offset index of {count} records, {} bytes before the footer",
        stream_len - FOOTER_SIZE - index_start,
    );
    Ok(offsets)
}

/// Parse every record header by walking the tar container from the start.
///
/// This is O(n) in both time and memory and is meant for archives that lack
/// a usable index.
pub fn scan_records<R: ReadAt + Size + ?Sized>(rdr: &RecordReader<R>) -> Result<Vec<RecordHeader>> {
    trace_time!("scan all records");

    let stream_len = stream_len(rdr.get_ref())?;
    info!("rescanning all records in {stream_len} bytes");
    let headers = rdr
        .entries(stream_len)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to scan records")?;
    debug!("found {} records by scanning", headers.len());
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{ErrorKind, footer::index_checksum};

    /// Records every positioned read.
    struct Recorder {
        data: Vec<u8>,
        reads: RefCell<Vec<(u64, usize)>>,
    }

    impl ReadAt for Recorder {
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads.borrow_mut().push((pos, buf.len()));
            self.data.read_at(pos, buf)
        }
    }

    impl Size for Recorder {
        fn size(&self) -> std::io::Result<Option<u64>> {
            Ok(Some(self.data.len() as u64))
        }
    }

    /// An archive body of `prefix` zero bytes followed by an index and a footer.
    fn indexed(prefix: usize, offsets: &[u64]) -> Vec<u8> {
        let index = offsets
            .iter()
            .flat_map(|off| off.to_le_bytes())
            .collect::<Vec<_>>();
        let footer = Footer::new(prefix as u64, offsets.len() as u64, index_checksum(&index));
        let mut buf = vec![0u8; prefix];
        buf.extend_from_slice(&index);
        buf.extend_from_slice(&footer.encode());
        buf
    }

    fn offsets(count: u64) -> Vec<u64> {
        (0..count).map(|i| i * 1024).collect()
    }

    #[test]
    fn paged_loading() {
        let rdr = Recorder {
            data: indexed(10240, &offsets(10)),
            reads: RefCell::default(),
        };
        let mut index = BufferedIndex::open(&rdr, NonZero::new(2).unwrap()).unwrap();
        assert_eq!(index.len(), 10);
        assert!(index.loaded_blocks().is_empty());
        rdr.reads.borrow_mut().clear();

        assert_eq!(index.get(&rdr, 7).unwrap(), 7 * 1024);
        assert_eq!(index.loaded_blocks(), [3]);
        assert_eq!(*rdr.reads.borrow(), [(10240 + 6 * 8, 16)]);

        // Same block, no more reads.
        assert_eq!(index.get(&rdr, 6).unwrap(), 6 * 1024);
        assert_eq!(rdr.reads.borrow().len(), 1);

        // The last block is short.
        assert_eq!(index.get(&rdr, 9).unwrap(), 9 * 1024);
        assert_eq!(index.loaded_blocks(), [3, 4]);
        assert_eq!(rdr.reads.borrow()[1], (10240 + 9 * 8 - 8, 16));
    }

    #[test]
    fn short_last_block() {
        let data = indexed(512, &offsets(5));
        let mut index = BufferedIndex::open(&data, NonZero::new(4).unwrap()).unwrap();
        assert_eq!(index.get(&data, 4).unwrap(), 4096);
        assert_eq!(index.loaded_blocks(), [1]);
        assert_eq!(index.blocks[&1].len(), 1);
    }

    #[test]
    fn set_and_range() {
        let data = indexed(0, &offsets(3));
        let mut index = BufferedIndex::open(&data, NonZero::new(2).unwrap()).unwrap();
        index.set(&data, 2, 4242).unwrap();
        assert_eq!(index.get(&data, 2).unwrap(), 4242);
        assert_eq!(index.get(&data, 1).unwrap(), 1024);

        let err = index.get(&data, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(err.to_string(), "record 3 is out of range for 3 records");
        assert_eq!(index.set(&data, 3, 0).unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn missing_footer() {
        let data = vec![0u8; 4096];
        let err = BufferedIndex::open(&data, NonZero::new(2).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoIndex);
        let err = load_index(&data, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoIndex);

        let tiny = vec![0u8; 8];
        let err = BufferedIndex::open(&tiny, NonZero::new(2).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoIndex);
    }

    #[test]
    fn bad_geometry() {
        let mut data = indexed(1024, &offsets(4));
        data.insert(0, 0);
        let err = BufferedIndex::open(&data, NonZero::new(2).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
        let err = load_index(&data, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
    }

    #[test]
    fn eager_loading() {
        let expect = offsets(100);
        let data = indexed(200 * 1024, &expect);
        assert_eq!(load_index(&data, usize::MAX).unwrap(), expect);

        let err = load_index(&data, 799).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Limit);
        assert_eq!(load_index(&data, 800).unwrap().len(), 100);

        assert_eq!(load_index(&indexed(0, &[]), 0).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn eager_checksum_mismatch() {
        let mut data = indexed(4096, &offsets(8));
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let err = load_index(&data, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
        assert_eq!(err.to_string(), "corrupt index: checksum mismatch");

        // Unverified paging does not notice.
        let mut index = BufferedIndex::open(&data, NonZero::new(3).unwrap()).unwrap();
        assert_eq!(index.get(&data, 5).unwrap(), 5 * 1024);
    }

    #[test]
    fn eager_rejects_unordered() {
        let data = indexed(4096, &[0, 1024, 1024]);
        let err = load_index(&data, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
        assert_eq!(
            err.to_string(),
            "corrupt index: offsets are not increasing at record 2",
        );

        let data = indexed(4096, &[0, 4096]);
        let err = load_index(&data, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptIndex);
    }
}
