use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Fixed-width hash identifying an entry's backing files. Derived purely
/// from the cache key, so no directory lookup is needed to locate a file.
pub type EntryHash = u64;

/// Deterministic mapping from cache keys to `EntryHash` values. Collisions
/// are not modeled: the stored key bytes are compared on open and a
/// mismatch is reported as a missing entry.
pub struct KeyHasher {
    crc64: Crc<u64>,
}

impl std::fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyHasher")
    }
}

impl KeyHasher {
    pub fn new() -> Self {
        Self {
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
        }
    }

    pub fn hash(&self, key: &[u8]) -> EntryHash {
        self.crc64.checksum(key)
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental CRC-32C over stream content. Tracks how many bytes of the
/// stream prefix the digest covers, so the engine can tell whether a write
/// sequence stayed strictly sequential from offset zero.
#[derive(Debug, Clone, Copy)]
pub struct StreamHasher {
    state: u32,
    covered: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self {
            state: 0,
            covered: 0,
        }
    }

    /// Resume from a digest known to cover `covered` bytes, e.g. a trailer
    /// CRC that was validated during open.
    pub fn resume(state: u32, covered: u64) -> Self {
        Self { state, covered }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, data);
        self.covered += data.len() as u64;
    }

    pub fn value(&self) -> u32 {
        self.state
    }

    pub fn covered(&self) -> u64 {
        self.covered
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_deterministic() {
        let hasher = KeyHasher::new();
        assert_eq!(
            hasher.hash(b"http://example.com/a"),
            hasher.hash(b"http://example.com/a")
        );
        assert_ne!(
            hasher.hash(b"http://example.com/a"),
            hasher.hash(b"http://example.com/b")
        );
    }

    #[test]
    fn test_incremental_matches_single_shot() {
        let mut incremental = StreamHasher::new();
        incremental.update(b"hello ");
        incremental.update(b"world");

        let mut single = StreamHasher::new();
        single.update(b"hello world");

        assert_eq!(incremental.value(), single.value());
        assert_eq!(incremental.covered(), 11);
    }

    #[test]
    fn test_resume_continues_prefix() {
        let mut first = StreamHasher::new();
        first.update(b"hello ");

        let mut resumed = StreamHasher::resume(first.value(), first.covered());
        resumed.update(b"world");

        let mut single = StreamHasher::new();
        single.update(b"hello world");

        assert_eq!(resumed.value(), single.value());
        assert_eq!(resumed.covered(), single.covered());
    }
}
