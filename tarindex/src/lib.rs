//! A library for reading indexed, append-only tar archives.
//!
//! An archive is a plain ustar container of named records, followed by a
//! trailing offset index and a fixed-size [`Footer`]. Readers use the index to
//! fetch any record by its ordinal in O(1) seeks, without loading the whole
//! index into memory. Archives without a usable index (legacy archives, or
//! archives whose writer never closed) are still readable by a linear rescan
//! of the tar container.
//!
//! For writing archives, check the `tarindex-enc` crate.
//!
//! ## Examples
//!
//! ```no_run
//! use tarindex::{Archive, Config, IndexStrategy};
//!
//! # fn work() -> tarindex::Result<()> {
//! let mut archive = Archive::open("records.tar")?;
//! for i in 0..archive.len() {
//!     let name = archive.name(i)?.to_owned();
//!     let payload = archive.read(i)?;
//!     println!("{name}: {} bytes", payload.len());
//! }
//!
//! // Verify the whole index against its checksum before trusting it.
//! let config = Config::default()
//!     .index_strategy(IndexStrategy::Verified)
//!     .fallback_on_corrupt_index(true);
//! let archive = Archive::open_with_config("records.tar", &config)?;
//! # Ok(()) }
//! ```
//!
//! ## Cargo features
//!
//! - `log` *(Enabled by default)*
//!
//!   Emit diagnostics and timing through the [`log`](https://crates.io/crates/log)
//!   facade.
//!
//! - `serialize`
//!
//!   Derive `serde` traits on [`Config`] so it can be loaded from a config file.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

#[cfg(feature = "log")]
#[macro_use(trace_time)]
extern crate measure_time;

#[cfg(feature = "log")]
#[macro_use(trace, debug, info, warn)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }

    macro_rules! debug {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! info {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! warn {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }

    macro_rules! trace_time {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }
}

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

pub mod archive;
mod error;
pub mod footer;
pub mod index;
pub mod tar;

pub use positioned_io;
pub use zerocopy;

pub use archive::{Archive, Config, IndexSource, IndexStrategy};
pub use error::{Error, ErrorKind, Result};
pub use footer::Footer;
pub use index::BufferedIndex;
pub use tar::RecordHeader;
