#![deny(missing_docs)]
//! An embedded key/value store in the Bitcask append-only log format.
//!
//! A store is a directory of numbered segment files. Writes append to the
//! single active segment, reads go straight to a known file offset through
//! the in-memory keydir, deletes append tombstones, and [`Cask::merge`]
//! compacts sealed segments down to their live records.

mod config;
mod error;
mod keydir;
mod record;
mod recovery;
mod segment;
mod store;

pub use config::{Config, MIN_SEGMENT_THRESHOLD_BYTES};
pub use error::{Error, Result};
pub use store::{Cask, Stats};
