//! A library for writing indexed append-only tar archives,
//! building on top of [`tarindex` crate][::tarindex].
//!
//! For reading archives only, check [`tarindex` crate][::tarindex] instead.
//!
//! Archives are plain POSIX ustar files, readable by any tar tool, with an
//! offset index and a fixed-size footer appended after the end-of-archive
//! marker. Readers use the index to locate any record without scanning.
//!
//! ## Examples
//!
//! ```no_run
//! use tarindex_enc::Writer;
//!
//! # fn work() -> tarindex_enc::Result<()> {
//! let mut writer = Writer::create("out.tar")?;
//! let first = writer.write("greeting.txt", b"hello world")?;
//! let second = writer.write("empty", b"")?;
//! assert_eq!((first, second), (0, 1));
//!
//! // Optional. Dropping the writer also closes it, but errors are only logged.
//! writer.close()?;
//! # Ok(()) }
//! ```
//!
//! See also the simple `mktar` impl at `./examples/mktar.rs`.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod error;
pub mod tar;
mod writer;

use self::error::ErrorInner;
pub use self::error::{Error, ErrorKind, Result};
pub use self::writer::Writer;
