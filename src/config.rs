use std::path::Path;

use crate::error::Result;
use crate::store::Cask;

/// Smallest accepted segment threshold. Builder values below this are
/// clamped up to it.
pub const MIN_SEGMENT_THRESHOLD_BYTES: u64 = 1024;

const DEFAULT_SEGMENT_THRESHOLD_BYTES: u64 = 128 * 1024 * 1024;

/// Configuration for a `Cask` store.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) segment_threshold_bytes: u64,
    pub(crate) sync_on_put: bool,
    pub(crate) read_only: bool,
    pub(crate) merge_min_segments: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_threshold_bytes: DEFAULT_SEGMENT_THRESHOLD_BYTES,
            sync_on_put: false,
            read_only: false,
            merge_min_segments: 2,
        }
    }
}

impl Config {
    /// Open a `Cask` store at the given path with these options.
    pub fn open<P>(self, path: P) -> Result<Cask>
    where
        P: AsRef<Path>,
    {
        Cask::open_with(path.as_ref(), self)
    }

    /// Set the size at which the active segment is sealed and a new one is
    /// started. Default `128MiB`; values below `1KiB` are clamped.
    pub fn segment_threshold_bytes(mut self, threshold: u64) -> Self {
        self.segment_threshold_bytes = threshold.max(MIN_SEGMENT_THRESHOLD_BYTES);
        self
    }

    /// Fsync the active segment after every write. Default `false`.
    pub fn sync_on_put(mut self, sync_on_put: bool) -> Self {
        self.sync_on_put = sync_on_put;
        self
    }

    /// Open the store for reads only: no files are created and `put`,
    /// `delete`, and `merge` are rejected. Default `false`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Minimum number of candidate segments, the about-to-be-sealed active
    /// included, for `merge` to do any work. Default `2`.
    pub fn merge_min_segments(mut self, merge_min_segments: usize) -> Self {
        self.merge_min_segments = merge_min_segments;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_clamped() {
        let config = Config::default().segment_threshold_bytes(64);
        assert_eq!(config.segment_threshold_bytes, MIN_SEGMENT_THRESHOLD_BYTES);
    }
}
