use std::path::PathBuf;

/// Configuration for the cache storage engine
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding every entry's backing files
    pub dir: PathBuf,

    /// Size of one sparse child block (default: 1MiB). Must be a power of
    /// two; sparse offsets are decomposed as `offset / sparse_block_size`.
    pub sparse_block_size: u64,

    /// Maximum size accepted for stream 0, which is held in memory for the
    /// duration of a session (default: 256KiB)
    pub max_stream0_size: u64,

    /// Fsync backing files when an entry closes (default: false)
    pub sync_on_close: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinder"),
            sparse_block_size: 1024 * 1024, // 1MiB
            max_stream0_size: 256 * 1024,   // 256KiB
            sync_on_close: false,
        }
    }
}

impl CacheConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the sparse child block size
    pub fn sparse_block_size(mut self, size: u64) -> Self {
        debug_assert!(size.is_power_of_two());
        self.sparse_block_size = size;
        self
    }

    /// Set the maximum in-memory size for stream 0
    pub fn max_stream0_size(mut self, size: u64) -> Self {
        self.max_stream0_size = size;
        self
    }

    /// Fsync backing files when an entry closes
    pub fn sync_on_close(mut self, enabled: bool) -> Self {
        self.sync_on_close = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.dir, PathBuf::from("./cinder"));
        assert_eq!(config.sparse_block_size, 1024 * 1024);
        assert_eq!(config.max_stream0_size, 256 * 1024);
        assert!(!config.sync_on_close);
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new("/tmp/test")
            .sparse_block_size(64 * 1024)
            .max_stream0_size(16 * 1024)
            .sync_on_close(true);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.sparse_block_size, 64 * 1024);
        assert_eq!(config.max_stream0_size, 16 * 1024);
        assert!(config.sync_on_close);
    }
}
