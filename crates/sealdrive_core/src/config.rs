//! Local cache configuration.

/// Configuration for a [`crate::LocalCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of superseded journal records tolerated before
    /// [`crate::LocalCache::compact_if_needed`] rewrites the journal.
    pub compact_threshold: usize,

    /// Whether every mutation is flushed to stable storage before it is
    /// applied in memory.
    pub sync_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 1024,
            sync_on_write: true,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub const fn compact_threshold(mut self, records: usize) -> Self {
        self.compact_threshold = records;
        self
    }

    /// Sets whether writes are flushed before being applied.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = CacheConfig::new().compact_threshold(8).sync_on_write(false);
        assert_eq!(config.compact_threshold, 8);
        assert!(!config.sync_on_write);
        assert_eq!(CacheConfig::default().compact_threshold, 1024);
    }
}
