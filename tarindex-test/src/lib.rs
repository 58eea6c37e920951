//! Shared helpers for the end-to-end tests and the `verify` command.
use std::{error::Error, fmt, path::Path};

use tarindex::{Archive, Config, IndexSource, IndexStrategy};
use tarindex_enc::Writer;

/// Deterministic records of varied sizes, covering empty payloads, exact
/// block multiples and names too long for a single tar header.
#[must_use]
pub fn sample_records(count: usize) -> Vec<(String, Vec<u8>)> {
    (0..count)
        .map(|i| {
            let name = match i % 7 {
                3 => format!("{}/record-{i}", "nested".repeat(20)),
                _ => format!("dir{}/record-{i}", i % 5),
            };
            let len = match i % 4 {
                0 => 0,
                1 => 512,
                2 => i * 37 % 3000,
                _ => 1,
            };
            let data = (0..len).map(|j| (i * 31 + j) as u8).collect();
            (name, data)
        })
        .collect()
}

/// Write `records` into a new archive at `path` and return the writer offsets.
pub fn write_archive(path: &Path, records: &[(String, Vec<u8>)]) -> tarindex_enc::Result<Vec<u64>> {
    let mut writer = Writer::create(path)?;
    for (i, (name, data)) in records.iter().enumerate() {
        let ordinal = writer.write(name, data)?;
        debug_assert_eq!(ordinal, i as u64);
    }
    let offsets = writer.offsets().to_vec();
    writer.close()?;
    Ok(offsets)
}

/// The outcome of [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// The number of records.
    pub records: u64,
    /// The sum of all payload sizes.
    pub payload_bytes: u64,
    /// The index the records were located with.
    pub source: IndexSource,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} payload bytes, {:?} index",
            self.records, self.payload_bytes, self.source,
        )
    }
}

/// Read every record of an archive and cross-check the index against a full
/// scan of the tar container.
pub fn verify(path: &Path) -> Result<Report, Box<dyn Error>> {
    let config = Config::default()
        .index_strategy(IndexStrategy::Verified)
        .fallback_on_corrupt_index(true);
    let mut archive = Archive::open_with_config(path, &config)?;
    let scan = Config::default().index_strategy(IndexStrategy::Scan);
    let mut scanned = Archive::open_with_config(path, &scan)?;

    if archive.len() != scanned.len() {
        return Err(format!(
            "index has {} records but scanning found {}",
            archive.len(),
            scanned.len(),
        )
        .into());
    }

    let mut payload_bytes = 0u64;
    for i in 0..archive.len() {
        let header = archive.header(i)?.clone();
        if header != *scanned.header(i)? {
            return Err(format!("record {i} differs between index and scan").into());
        }
        payload_bytes += archive.read(i)?.len() as u64;
    }

    Ok(Report {
        records: archive.len(),
        payload_bytes,
        source: archive.index_source(),
    })
}
