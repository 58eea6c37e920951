//! The low-level tar container builder.
//!
//! See [`tarindex::tar`] for the layout. Every record is written as a
//! regular-file entry with fixed ownership and timestamps, so the same
//! sequence of records always produces the same bytes.
use std::io::Write;

use tarindex::tar::{BLOCK_SIZE, Header, TRAILER_SIZE};
use zerocopy::IntoBytes;

use crate::{ErrorInner, Result};

/// The length of the header `name` field.
const NAME_FIELD_SIZE: usize = 100;

const ZERO_BLOCK: [u8; BLOCK_SIZE as usize] = [0; BLOCK_SIZE as usize];

/// Check a record name before anything is written.
pub(crate) fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        bail!(ErrorInner::InvalidName("empty name"));
    }
    if name.contains(&0) {
        bail!(ErrorInner::InvalidName("name contains a NUL byte"));
    }
    Ok(())
}

/// A sequential tar container writer which tracks its own append position.
///
/// The builder never seeks, so any [`Write`] sink works, including
/// in-memory buffers.
#[derive(Debug)]
pub struct Builder<W: ?Sized> {
    position: u64,
    w: W,
}

impl<W> Builder<W> {
    /// Start a new container at the beginning of `w`.
    pub const fn new(w: W) -> Self {
        Self { position: 0, w }
    }
}

impl<W: ?Sized> Builder<W> {
    /// The number of bytes written so far, which is where the next entry starts.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.w
    }

    /// Get a mutable reference to the underlying writer.
    ///
    /// Writing through it breaks the position tracking.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.w
    }

    /// Retrieve the ownership of the underlying writer.
    pub fn into_inner(self) -> W
    where
        W: Sized,
    {
        self.w
    }
}

impl<W: Write + ?Sized> Builder<W> {
    /// Append a regular-file entry and return the offset it starts at.
    ///
    /// Names longer than the header field are preceded by a GNU long name
    /// entry, which the returned offset points to.
    pub fn append(&mut self, name: &[u8], data: &[u8]) -> Result<u64> {
        validate_name(name)?;
        let offset = self.position;
        if name.len() > NAME_FIELD_SIZE {
            // The name is stored NUL-terminated, like GNU tar does.
            let mut long_name = Vec::with_capacity(name.len() + 1);
            long_name.extend_from_slice(name);
            long_name.push(0);
            self.write_entry(Header::TYPE_GNU_LONG_NAME, Header::LONG_LINK_NAME, &long_name)?;
        }
        self.write_entry(Header::TYPE_REGULAR, name, data)?;
        Ok(offset)
    }

    fn write_entry(&mut self, typeflag: u8, name: &[u8], data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        let padding = size.next_multiple_of(BLOCK_SIZE) - size;
        let next = size
            .checked_add(padding + BLOCK_SIZE)
            .and_then(|len| self.position.checked_add(len))
            .ok_or(ErrorInner::Limit("archive size exceeds 2^64 bytes"))?;

        let header = Header::new(typeflag, name, size);
        self.w.write_all(header.as_bytes())?;
        self.w.write_all(data)?;
        self.w.write_all(&ZERO_BLOCK[..padding as usize])?;
        self.position = next;
        Ok(())
    }

    /// Write the end-of-archive marker.
    ///
    /// The writer is not flushed. Appending more entries afterwards produces
    /// a container whose later entries are invisible to tar tools.
    pub fn finish(&mut self) -> Result<()> {
        for _ in 0..TRAILER_SIZE / BLOCK_SIZE {
            self.w.write_all(&ZERO_BLOCK)?;
        }
        self.position = self
            .position
            .checked_add(TRAILER_SIZE)
            .ok_or(ErrorInner::Limit("archive size exceeds 2^64 bytes"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tarindex::tar::RecordReader;

    use super::*;
    use crate::ErrorKind;

    #[test]
    fn layout() {
        let mut builder = Builder::new(Vec::new());
        assert_eq!(builder.append(b"a", b"hello").unwrap(), 0);
        assert_eq!(builder.position(), 1024);
        assert_eq!(builder.append(b"b", &[1; 512]).unwrap(), 1024);
        assert_eq!(builder.position(), 2048);
        assert_eq!(builder.append(b"c", b"").unwrap(), 2048);
        builder.finish().unwrap();
        assert_eq!(builder.position(), 2560 + 1024);

        let buf = builder.into_inner();
        let len = buf.len() as u64;
        assert_eq!(len, 2560 + 1024);
        assert!(buf[2560..].iter().all(|&b| b == 0));

        let rdr = RecordReader::new(buf);
        let header = rdr.read_header_at(1024).unwrap();
        assert_eq!(header.name(), "b");
        assert_eq!(header.payload_offset(), 1536);
        assert_eq!(rdr.read_payload(&header, 512).unwrap(), [1; 512]);
        let names = rdr
            .entries(len)
            .map(|header| header.unwrap().name().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn long_name() {
        let name = "x".repeat(300);
        let mut builder = Builder::new(Vec::new());
        assert_eq!(builder.append(name.as_bytes(), b"data").unwrap(), 0);
        // Long name header + 301 bytes, then the record header + 4 bytes.
        assert_eq!(builder.position(), 4 * BLOCK_SIZE);
        let offset = builder.append(b"short", b"").unwrap();
        assert_eq!(offset, 4 * BLOCK_SIZE);

        let rdr = RecordReader::new(builder.into_inner());
        let header = rdr.read_header_at(0).unwrap();
        assert_eq!(header.name(), name.as_str());
        assert_eq!(header.offset(), 0);
        assert_eq!(rdr.read_payload(&header, 4).unwrap(), b"data");
    }

    #[test]
    fn exactly_field_sized_name() {
        let name = [b'n'; NAME_FIELD_SIZE];
        let mut builder = Builder::new(Vec::new());
        builder.append(&name, b"").unwrap();
        assert_eq!(builder.position(), BLOCK_SIZE);
        let rdr = RecordReader::new(builder.into_inner());
        assert_eq!(rdr.read_header_at(0).unwrap().name(), &name[..]);
    }

    #[test]
    fn invalid_names() {
        let mut builder = Builder::new(Vec::new());
        for name in [&b""[..], b"a\0b"] {
            let err = builder.append(name, b"data").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidName);
        }
        assert_eq!(builder.position(), 0);
        assert!(builder.get_ref().is_empty());
    }
}
