//! Options applied when a container is opened.

use crate::integrity::IntegrityCheckLevel;
use crate::storage::cache::{DEFAULT_BLOCK_SIZE, DEFAULT_CAPACITY};

/// How sections of an opened container are read.
///
/// ```
/// use nxvault::config::OpenOptions;
/// use nxvault::integrity::IntegrityCheckLevel;
///
/// let opts = OpenOptions::new()
///     .integrity_level(IntegrityCheckLevel::WarnOnInvalid)
///     .cache_capacity(16);
/// assert_eq!(opts.cache_block_size, 0x4000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Policy used by [`crate::formats::nca::Nca::open_storage`] when the
    /// caller does not pass one.
    pub integrity_level: IntegrityCheckLevel,
    /// Block size of the cache placed in front of each decrypted section.
    pub cache_block_size: u64,
    /// Blocks kept per section cache. Zero disables caching.
    pub cache_capacity: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            integrity_level: IntegrityCheckLevel::default(),
            cache_block_size: DEFAULT_BLOCK_SIZE,
            cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn integrity_level(mut self, level: IntegrityCheckLevel) -> Self {
        self.integrity_level = level;
        self
    }

    pub fn cache_block_size(mut self, block_size: u64) -> Self {
        self.cache_block_size = block_size.max(1);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let opts = OpenOptions::default();
        assert_eq!(opts.integrity_level, IntegrityCheckLevel::ErrorOnInvalid);
        assert_eq!(opts.cache_capacity, 4);

        let opts = OpenOptions::new()
            .integrity_level(IntegrityCheckLevel::None)
            .cache_block_size(0)
            .cache_capacity(0);
        assert_eq!(opts.integrity_level, IntegrityCheckLevel::None);
        assert_eq!(opts.cache_block_size, 1);
        assert_eq!(opts.cache_capacity, 0);
    }
}
