use std::cell::RefCell;

use zerocopy::IntoBytes;

use super::*;
use crate::{
    footer::{Footer, index_checksum},
    tar::{BLOCK_SIZE, Header, TRAILER_SIZE},
};

/// Counts every positioned read.
struct Recorder {
    data: Vec<u8>,
    reads: RefCell<Vec<(u64, usize)>>,
}

impl Recorder {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            reads: RefCell::default(),
        }
    }
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

/// A bare tar container of regular-file records, and the record offsets.
fn container(records: &[(&str, &[u8])]) -> (Vec<u8>, Vec<u64>) {
    let mut buf = Vec::new();
    let mut offsets = Vec::new();
    for (name, data) in records {
        offsets.push(buf.len() as u64);
        let header = Header::new(Header::TYPE_REGULAR, name.as_bytes(), data.len() as u64);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(data);
        buf.resize(buf.len().next_multiple_of(BLOCK_SIZE as usize), 0);
    }
    buf.resize(buf.len() + TRAILER_SIZE as usize, 0);
    (buf, offsets)
}

fn append_index(buf: &mut Vec<u8>, offsets: &[u64]) {
    let index = offsets
        .iter()
        .flat_map(|off| off.to_le_bytes())
        .collect::<Vec<_>>();
    let footer = Footer::new(buf.len() as u64, offsets.len() as u64, index_checksum(&index));
    buf.extend_from_slice(&index);
    buf.extend_from_slice(&footer.encode());
}

const RECORDS: &[(&str, &[u8])] = &[
    ("alpha", b"hello"),
    ("beta", b""),
    ("gamma", &[0x42; 1000]),
];

fn indexed() -> Vec<u8> {
    let (mut buf, offsets) = container(RECORDS);
    append_index(&mut buf, &offsets);
    buf
}

fn check_records<R: ReadAt>(archive: &mut Archive<R>) {
    assert_eq!(archive.len(), RECORDS.len() as u64);
    for (i, (name, data)) in RECORDS.iter().enumerate() {
        let i = i as u64;
        assert_eq!(archive.name(i).unwrap(), *name);
        assert_eq!(archive.read(i).unwrap(), *data);
    }
}

#[test]
fn strategies() {
    let data = indexed();
    for (strategy, source) in [
        (IndexStrategy::Buffered, IndexSource::Buffered),
        (IndexStrategy::Verified, IndexSource::Verified),
        (IndexStrategy::Scan, IndexSource::Scanned),
    ] {
        let config = Config::default().index_strategy(strategy);
        let mut archive = Archive::new_with_config(data.clone(), &config).unwrap();
        assert_eq!(archive.index_source(), source);
        check_records(&mut archive);
    }
}

#[test]
fn memoized_headers() {
    let (mut data, offsets) = container(RECORDS);
    append_index(&mut data, &offsets);
    let mut archive = Archive::new(Recorder::new(data)).unwrap();
    let reads = |archive: &Archive<Recorder>| archive.get_ref().unwrap().reads.borrow().clone();
    let before = reads(&archive).len();

    assert_eq!(archive.read(2).unwrap(), RECORDS[2].1);
    let first = reads(&archive)[before..].to_vec();
    // One index block, one header, one payload.
    assert_eq!(first.len(), 3);
    assert_eq!(first[1], (offsets[2], BLOCK_SIZE as usize));

    assert_eq!(archive.read(2).unwrap(), RECORDS[2].1);
    let second = reads(&archive)[before + first.len()..].to_vec();
    assert_eq!(second, [(offsets[2] + BLOCK_SIZE, 1000)]);

    let Slots::Paged { slots, .. } = &archive.slots else {
        panic!("expecting paged slots");
    };
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[&2].offset, offsets[2]);
    assert!(slots[&2].header.as_ref().is_some_and(|header| header.offset() == offsets[2]));
}

#[test]
fn out_of_range() {
    let mut archive = Archive::new(indexed()).unwrap();
    let err = archive.read(3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(archive.header(u64::MAX).unwrap_err().kind(), ErrorKind::OutOfRange);
    // Still usable.
    assert_eq!(archive.read(0).unwrap(), b"hello");
}

#[test]
fn close() {
    let mut archive = Archive::new(indexed()).unwrap();
    assert_eq!(archive.read(0).unwrap(), b"hello");
    archive.close();
    assert!(archive.is_closed());
    assert_eq!(archive.read(0).unwrap_err().kind(), ErrorKind::Closed);
    assert_eq!(archive.name(1).unwrap_err().kind(), ErrorKind::Closed);
    archive.close();
    assert!(archive.get_ref().is_none());
    assert!(archive.into_inner().is_none());
}

#[test]
fn fallback_without_footer() {
    let (data, _) = container(RECORDS);
    for strategy in [IndexStrategy::Buffered, IndexStrategy::Verified] {
        let config = Config::default().index_strategy(strategy);
        let mut archive = Archive::new_with_config(data.clone(), &config).unwrap();
        assert_eq!(archive.index_source(), IndexSource::Scanned);
        check_records(&mut archive);
    }

    // Not even finalized by the end-of-archive marker.
    let unfinished = data[..data.len() - TRAILER_SIZE as usize].to_vec();
    let mut archive = Archive::new(unfinished).unwrap();
    check_records(&mut archive);

    let mut empty = Archive::new(Vec::new()).unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.read(0).unwrap_err().kind(), ErrorKind::OutOfRange);
}

#[test]
fn corrupt_index() {
    let mut data = indexed();
    // Flip a byte of the first index entry.
    let (_, offsets) = container(RECORDS);
    let index_start = data.len() - 40 - offsets.len() * 8;
    data[index_start] ^= 1;

    let verified = Config::default().index_strategy(IndexStrategy::Verified);
    let err = Archive::new_with_config(data.clone(), &verified).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptIndex);

    let mut archive =
        Archive::new_with_config(data.clone(), &verified.fallback_on_corrupt_index(true)).unwrap();
    assert_eq!(archive.index_source(), IndexSource::Scanned);
    check_records(&mut archive);

    // Paging trusts the index and only fails on the damaged entry.
    let mut archive = Archive::new(data).unwrap();
    assert_eq!(archive.index_source(), IndexSource::Buffered);
    assert_eq!(archive.read(1).unwrap(), b"");
    assert_eq!(archive.read(0).unwrap_err().kind(), ErrorKind::MalformedRecord);
}

#[test]
fn bad_geometry() {
    let mut data = indexed();
    // One stray byte between the index and the footer.
    data.insert(data.len() - 40, 0);

    let err = Archive::new(data.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptIndex);

    let config = Config::default().fallback_on_corrupt_index(true);
    let archive = Archive::new_with_config(data, &config).unwrap();
    assert_eq!(archive.index_source(), IndexSource::Scanned);
    assert_eq!(archive.len(), 3);
}

#[test]
fn scan_malformed() {
    let (mut data, offsets) = container(RECORDS);
    // Break the checksum of the second header.
    data[offsets[1] as usize] ^= 1;
    let err = Archive::new(data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);
}

#[test]
fn scan_truncated_tail() {
    let (data, offsets) = container(RECORDS);
    // Cut in the middle of the last payload, then of the last header.
    for cut in [offsets[2] + 600, offsets[2] + 100] {
        let mut archive = Archive::new(data[..cut as usize].to_vec()).unwrap();
        assert_eq!(archive.index_source(), IndexSource::Scanned);
        assert_eq!(archive.len(), 2);
        for (i, (name, payload)) in RECORDS[..2].iter().enumerate() {
            assert_eq!(archive.name(i as u64).unwrap(), *name);
            assert_eq!(archive.read(i as u64).unwrap(), *payload);
        }
        assert_eq!(archive.read(2).unwrap_err().kind(), ErrorKind::OutOfRange);
    }
}

#[test]
fn limits() {
    let config = Config::default().payload_size_limit(999);
    let mut archive = Archive::new_with_config(indexed(), &config).unwrap();
    assert_eq!(archive.read(0).unwrap(), b"hello");
    assert_eq!(archive.read(2).unwrap_err().kind(), ErrorKind::Limit);
    // The header is still available.
    assert_eq!(archive.header(2).unwrap().payload_size(), 1000);

    let config = Config::default()
        .index_strategy(IndexStrategy::Verified)
        .index_size_limit(16);
    let err = Archive::new_with_config(indexed(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Limit);
}

#[test]
fn long_names() {
    let name = "d/".repeat(100) + "file";
    let mut data = Vec::new();
    let long = Header::new(
        Header::TYPE_GNU_LONG_NAME,
        Header::LONG_LINK_NAME,
        name.len() as u64 + 1,
    );
    data.extend_from_slice(long.as_bytes());
    data.extend_from_slice(name.as_bytes());
    data.resize(data.len().next_multiple_of(BLOCK_SIZE as usize), 0);
    data.extend_from_slice(Header::new(Header::TYPE_REGULAR, name.as_bytes(), 3).as_bytes());
    data.extend_from_slice(b"abc");
    data.resize(data.len().next_multiple_of(BLOCK_SIZE as usize) + TRAILER_SIZE as usize, 0);
    append_index(&mut data, &[0]);

    let mut archive = Archive::new(data).unwrap();
    assert_eq!(archive.name(0).unwrap(), name.as_str());
    assert_eq!(archive.header(0).unwrap().offset(), 0);
    assert_eq!(archive.header(0).unwrap().payload_offset(), 3 * BLOCK_SIZE);
    assert_eq!(archive.read(0).unwrap(), b"abc");
}
