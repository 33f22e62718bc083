pub mod format;
pub mod handle;
pub mod sparse;
pub mod store;

pub use handle::EntryHandle;

use std::time::SystemTime;

use crate::hasher::EntryHash;

/// Streams per entry: 0 = metadata, 1 = body, 2 = auxiliary.
pub const STREAM_COUNT: usize = 3;

/// Last-used / last-modified timestamps of an entry, updated as a side
/// effect of reads and writes respectively. Monotonic non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryMetadata {
    pub last_used: SystemTime,
    pub last_modified: SystemTime,
}

impl EntryMetadata {
    pub(crate) fn now() -> Self {
        let now = SystemTime::now();
        Self {
            last_used: now,
            last_modified: now,
        }
    }

    pub(crate) fn touch_used(&mut self) {
        self.last_used = self.last_used.max(SystemTime::now());
    }

    pub(crate) fn touch_modified(&mut self) {
        self.last_modified = self.last_modified.max(SystemTime::now());
    }
}

/// Backing file holding the header, key, streams 0 and 1, and their
/// trailers. Pure function of the entry hash.
pub(crate) fn primary_file_name(hash: EntryHash) -> String {
    format!("{:016x}_0", hash)
}

/// Backing file for the auxiliary stream. Present on disk only once that
/// stream receives a non-trivial write.
pub(crate) fn secondary_file_name(hash: EntryHash) -> String {
    format!("{:016x}_1", hash)
}

/// Backing file for one sparse child block. Named under the parent's hash
/// so a doom can enumerate children with a prefix scan.
pub(crate) fn child_file_name(hash: EntryHash, block_id: u64) -> String {
    format!("{:016x}_s{:x}", hash, block_id)
}

pub(crate) fn child_file_prefix(hash: EntryHash) -> String {
    format!("{:016x}_s", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names_are_pure_functions() {
        assert_eq!(primary_file_name(0xABCD), "000000000000abcd_0");
        assert_eq!(secondary_file_name(0xABCD), "000000000000abcd_1");
        assert_eq!(child_file_name(0xABCD, 0x20), "000000000000abcd_s20");
        assert!(child_file_name(0xABCD, 7).starts_with(&child_file_prefix(0xABCD)));
    }

    #[test]
    fn test_metadata_touch_is_monotonic() {
        let mut meta = EntryMetadata::now();
        let before = meta.last_used;
        meta.touch_used();
        assert!(meta.last_used >= before);

        let before = meta.last_modified;
        meta.touch_modified();
        assert!(meta.last_modified >= before);
    }
}
