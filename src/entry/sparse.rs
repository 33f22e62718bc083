use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::format::{EntryHeader, RangeTable, ENTRY_HEADER_SIZE, RANGE_TABLE_HEADER_SIZE};
use crate::entry::child_file_name;
use crate::error::Result;
use crate::hasher::{EntryHash, StreamHasher};
use crate::Error;

const CHILD_KEY_LEN: usize = 16;
const CHILD_DATA_BASE: u64 = ENTRY_HEADER_SIZE as u64 + CHILD_KEY_LEN as u64;

/// Identity of a sparse child: the parent hash and block id, verbatim.
/// Stored as the child file's key bytes and compared on open, so a foreign
/// file can never be mistaken for a child.
fn child_key(parent: EntryHash, block_id: u64) -> [u8; CHILD_KEY_LEN] {
    let mut buf = [0u8; CHILD_KEY_LEN];
    buf[..8].copy_from_slice(&parent.to_be_bytes());
    buf[8..].copy_from_slice(&block_id.to_be_bytes());
    buf
}

/// One fixed-size block of the sparse address space, backed by its own
/// file. Writes land at child-relative offsets inside a reserved data
/// region; which sub-ranges are populated is tracked in memory and
/// persisted as a range table after the data region on close.
struct ChildStore {
    file: File,
    block_size: u64,
    /// offset -> len within the block; ascending, coalesced, non-adjacent.
    runs: BTreeMap<u64, u64>,
}

impl ChildStore {
    fn create(
        config: &CacheConfig,
        parent: EntryHash,
        block_id: u64,
        unlinked: bool,
    ) -> Result<Self> {
        let path = config.dir.join(child_file_name(parent, block_id));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if unlinked {
            // The parent is doomed: the block stays usable through the
            // descriptor but must never outlive the session on disk.
            let _ = std::fs::remove_file(&path);
        }
        let header = EntryHeader::new(CHILD_KEY_LEN as u32, 0);
        file.write_all(&header.encode())?;
        file.write_all(&child_key(parent, block_id))?;
        Ok(Self {
            file,
            block_size: config.sparse_block_size,
            runs: BTreeMap::new(),
        })
    }

    /// Opens and validates an existing child. `NotFound` means no file;
    /// `Corrupt`/`ChecksumMismatch` mean the file exists but cannot be
    /// trusted — the caller treats both as an empty block.
    fn open(config: &CacheConfig, parent: EntryHash, block_id: u64) -> Result<Self> {
        let path = config.dir.join(child_file_name(parent, block_id));
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };

        let block_size = config.sparse_block_size;
        let file_len = file.metadata()?.len();
        let table_pos = CHILD_DATA_BASE + block_size;
        if file_len < table_pos + RANGE_TABLE_HEADER_SIZE as u64 {
            return Err(Error::Corrupt("child file too short for range table".into()));
        }

        let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = EntryHeader::decode(&header_buf)?;
        if header.key_len as usize != CHILD_KEY_LEN {
            return Err(Error::Corrupt("child key length mismatch".into()));
        }
        let mut stored_key = [0u8; CHILD_KEY_LEN];
        file.read_exact(&mut stored_key)?;
        if stored_key != child_key(parent, block_id) {
            return Err(Error::Corrupt("child identity mismatch".into()));
        }

        let mut table_buf = vec![0u8; (file_len - table_pos) as usize];
        file.seek(SeekFrom::Start(table_pos))?;
        file.read_exact(&mut table_buf)?;
        let table = RangeTable::decode(&table_buf, block_size)?;

        let mut runs = BTreeMap::new();
        for &(offset, len) in &table.ranges {
            runs.insert(offset as u64, len as u64);
        }

        if table.has_crc() {
            let mut hasher = StreamHasher::new();
            for (&offset, &len) in &runs {
                let mut buf = vec![0u8; len as usize];
                file.seek(SeekFrom::Start(CHILD_DATA_BASE + offset))?;
                file.read_exact(&mut buf)?;
                hasher.update(&buf);
            }
            if hasher.value() != table.crc32 {
                return Err(Error::ChecksumMismatch);
            }
        }

        Ok(Self {
            file,
            block_size,
            runs,
        })
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(offset + data.len() as u64 <= self.block_size);
        self.file.seek(SeekFrom::Start(CHILD_DATA_BASE + offset))?;
        self.file.write_all(data)?;
        insert_run(&mut self.runs, offset, data.len() as u64);
        Ok(())
    }

    /// Reads populated bytes starting exactly at `offset`, stopping at the
    /// first unpopulated byte or after `want` bytes.
    fn read_run(&mut self, offset: u64, want: usize) -> Result<Vec<u8>> {
        let (run_start, run_len) = match self.runs.range(..=offset).next_back() {
            Some((&s, &l)) if s + l > offset => (s, l),
            _ => return Ok(Vec::new()),
        };
        let n = (run_start + run_len - offset).min(want as u64) as usize;
        let mut buf = vec![0u8; n];
        self.file.seek(SeekFrom::Start(CHILD_DATA_BASE + offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// First populated position at or after `offset` and the contiguous
    /// populated length from that position.
    fn available_from(&self, offset: u64) -> Option<(u64, u64)> {
        if let Some((&s, &l)) = self.runs.range(..=offset).next_back() {
            if s + l > offset {
                return Some((offset, s + l - offset));
            }
        }
        self.runs
            .range(offset + 1..)
            .next()
            .map(|(&s, &l)| (s, l))
    }

    /// Persists the populated-run table (with a checksum over the populated
    /// bytes in run order) after the data region.
    fn close(mut self, sync: bool) -> Result<()> {
        let mut hasher = StreamHasher::new();
        for (&offset, &len) in &self.runs {
            let mut buf = vec![0u8; len as usize];
            self.file.seek(SeekFrom::Start(CHILD_DATA_BASE + offset))?;
            self.file.read_exact(&mut buf)?;
            hasher.update(&buf);
        }

        let ranges = self
            .runs
            .iter()
            .map(|(&offset, &len)| (offset as u32, len as u32))
            .collect();
        let table = RangeTable::new(hasher.value(), ranges);
        let encoded = table.encode();

        let table_pos = CHILD_DATA_BASE + self.block_size;
        self.file.seek(SeekFrom::Start(table_pos))?;
        self.file.write_all(&encoded)?;
        self.file.set_len(table_pos + encoded.len() as u64)?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn insert_run(runs: &mut BTreeMap<u64, u64>, start: u64, len: u64) {
    if len == 0 {
        return;
    }
    let mut new_start = start;
    let mut new_end = start + len;
    // Absorb every run overlapping or adjacent to the new one.
    let absorbed: Vec<u64> = runs
        .range(..=new_end)
        .filter(|(&s, &l)| s + l >= new_start)
        .map(|(&s, _)| s)
        .collect();
    for s in absorbed {
        let l = runs.remove(&s).unwrap();
        new_start = new_start.min(s);
        new_end = new_end.max(s + l);
    }
    runs.insert(new_start, new_end - new_start);
}

enum ChildSlot {
    Open(ChildStore),
    /// Missing on disk, or failed validation. Reads as zeros; not
    /// re-checked until a write recreates it.
    Empty,
}

/// Decomposes the 64-bit sparse address space of one entry into fixed-size
/// blocks, each backed by a `ChildStore` keyed from (parent hash, block
/// id). Calls spanning several blocks are split at block boundaries.
pub struct SparseIndex {
    config: Arc<CacheConfig>,
    parent: EntryHash,
    children: HashMap<u64, ChildSlot>,
    doomed: bool,
}

impl SparseIndex {
    pub fn new(config: Arc<CacheConfig>, parent: EntryHash) -> Self {
        Self {
            config,
            parent,
            children: HashMap::new(),
            doomed: false,
        }
    }

    /// After the parent is doomed, freshly created children are unlinked at
    /// birth so the doomed incarnation leaves nothing behind.
    pub fn set_doomed(&mut self) {
        self.doomed = true;
    }

    fn block_size(&self) -> u64 {
        self.config.sparse_block_size
    }

    /// Lazily opens the child for `block_id`, caching a validation failure
    /// as an empty block so corrupt children are not re-checked on every
    /// read.
    fn child(&mut self, block_id: u64) -> Result<Option<&mut ChildStore>> {
        if !self.children.contains_key(&block_id) {
            let slot = match ChildStore::open(&self.config, self.parent, block_id) {
                Ok(child) => ChildSlot::Open(child),
                Err(Error::NotFound) => ChildSlot::Empty,
                Err(Error::Corrupt(msg)) => {
                    tracing::warn!(
                        parent = %format_args!("{:016x}", self.parent),
                        block_id,
                        reason = %msg,
                        "Discarding invalid sparse child"
                    );
                    ChildSlot::Empty
                }
                Err(Error::ChecksumMismatch) => {
                    tracing::warn!(
                        parent = %format_args!("{:016x}", self.parent),
                        block_id,
                        "Discarding sparse child with checksum mismatch"
                    );
                    ChildSlot::Empty
                }
                Err(e) => return Err(e),
            };
            self.children.insert(block_id, slot);
        }
        match self.children.get_mut(&block_id).unwrap() {
            ChildSlot::Open(child) => Ok(Some(child)),
            ChildSlot::Empty => Ok(None),
        }
    }

    /// The child for `block_id`, created fresh if missing or previously
    /// found invalid.
    fn child_for_write(&mut self, block_id: u64) -> Result<&mut ChildStore> {
        if self.child(block_id)?.is_none() {
            let child = ChildStore::create(&self.config, self.parent, block_id, self.doomed)?;
            self.children.insert(block_id, ChildSlot::Open(child));
        }
        match self.children.get_mut(&block_id).unwrap() {
            ChildSlot::Open(child) => Ok(child),
            ChildSlot::Empty => unreachable!("child was just created"),
        }
    }

    /// Writes `data` at the sparse offset, split per block.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let bs = self.block_size();
        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block_id = pos / bs;
            let in_off = pos % bs;
            let n = ((bs - in_off) as usize).min(remaining.len());
            let child = self.child_for_write(block_id)?;
            child.write(in_off, &remaining[..n])?;
            pos += n as u64;
            remaining = &remaining[n..];
        }
        Ok(data.len())
    }

    /// Reads populated bytes starting at `offset`, stopping at the first
    /// unpopulated byte or after `len` bytes.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let bs = self.block_size();
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        let mut out = Vec::new();
        let mut pos = offset;
        while pos < end {
            let block_id = pos / bs;
            let in_off = pos % bs;
            let want = ((end - pos).min(bs - in_off)) as usize;
            let chunk = match self.child(block_id)? {
                None => break,
                Some(child) => child.read_run(in_off, want)?,
            };
            let n = chunk.len();
            out.extend_from_slice(&chunk);
            pos += n as u64;
            if n < want {
                break;
            }
        }
        Ok(out)
    }

    /// Longest contiguous populated run beginning at the first populated
    /// byte at or after `offset`, bounded by `len`. When nothing inside the
    /// window is populated, reports a zero-length run at the window's end.
    pub fn available_range(&mut self, offset: u64, len: u64) -> Result<(u64, u64)> {
        let bs = self.block_size();
        let end = offset
            .checked_add(len)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        if len == 0 {
            return Ok((0, offset));
        }

        // First populated byte at or after `offset`.
        let mut start = None;
        let mut pos = offset;
        while pos < end {
            let block_id = pos / bs;
            let in_off = pos % bs;
            if let Some(child) = self.child(block_id)? {
                if let Some((s, _)) = child.available_from(in_off) {
                    let abs = block_id * bs + s;
                    if abs < end {
                        start = Some(abs);
                    }
                    break;
                }
            }
            pos = (block_id + 1).saturating_mul(bs);
        }
        let start = match start {
            Some(start) => start,
            None => return Ok((0, end)),
        };

        // Extend the run, possibly across adjacent block edges, stopping at
        // the first unpopulated byte.
        let mut run_end = start;
        while run_end < end {
            let block_id = run_end / bs;
            let in_off = run_end % bs;
            let extended = match self.child(block_id)? {
                None => 0,
                Some(child) => match child.available_from(in_off) {
                    Some((s, l)) if s == in_off => l,
                    _ => 0,
                },
            };
            if extended == 0 {
                break;
            }
            run_end = run_end.saturating_add(extended);
            if in_off + extended < bs {
                // The run stopped before the block edge; the next byte is a
                // gap inside this block.
                break;
            }
        }

        Ok((run_end.min(end) - start, start))
    }

    /// Persists every open child's range table. Called when the owning
    /// entry closes.
    pub fn close_all(&mut self) -> Result<()> {
        let sync = self.config.sync_on_close;
        for (_, slot) in self.children.drain() {
            if let ChildSlot::Open(child) = slot {
                child.close(sync)?;
            }
        }
        Ok(())
    }

    /// Drops every child without persisting range tables; their files are
    /// already unlinked by the doom.
    pub fn discard_all(&mut self) {
        self.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir, block_size: u64) -> Arc<CacheConfig> {
        Arc::new(CacheConfig::new(dir.path()).sparse_block_size(block_size))
    }

    #[test]
    fn test_insert_run_coalesces() {
        let mut runs = BTreeMap::new();
        insert_run(&mut runs, 0, 10);
        insert_run(&mut runs, 20, 10);
        assert_eq!(runs.len(), 2);

        // Bridge the gap; all three coalesce.
        insert_run(&mut runs, 10, 10);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs.get(&0), Some(&30));

        // Overlapping insert extends.
        insert_run(&mut runs, 25, 10);
        assert_eq!(runs.get(&0), Some(&35));
    }

    #[test]
    fn test_available_range_stops_at_gap() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 1024 * 1024);
        let mut sparse = SparseIndex::new(config, 0xFEED);

        sparse.write(0x20F0000, &[1u8; 2048]).unwrap();
        sparse.write(0x20F4400, &[2u8; 2048]).unwrap();

        let (avail, start) = sparse.available_range(0x20F0000, 4096).unwrap();
        assert_eq!(avail, 2048);
        assert_eq!(start, 0x20F0000);
    }

    #[test]
    fn test_available_range_starts_at_first_populated_byte() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 64 * 1024);
        let mut sparse = SparseIndex::new(config, 0xFEED);

        sparse.write(1000, &[7u8; 500]).unwrap();

        let (avail, start) = sparse.available_range(0, 4096).unwrap();
        assert_eq!(start, 1000);
        assert_eq!(avail, 500);
    }

    #[test]
    fn test_available_range_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 64 * 1024);
        let mut sparse = SparseIndex::new(config, 0xFEED);

        let (avail, start) = sparse.available_range(5000, 100).unwrap();
        assert_eq!(avail, 0);
        assert_eq!(start, 5100);
    }

    #[test]
    fn test_write_spanning_blocks_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 4096);
        let mut sparse = SparseIndex::new(config.clone(), 0xBEEF);

        let data: Vec<u8> = (0..8192u32).map(|i| (i % 241) as u8).collect();
        sparse.write(2048, &data).unwrap();

        assert!(dir.path().join(child_file_name(0xBEEF, 0)).exists());
        assert!(dir.path().join(child_file_name(0xBEEF, 1)).exists());
        assert!(dir.path().join(child_file_name(0xBEEF, 2)).exists());

        assert_eq!(sparse.read(2048, 8192).unwrap(), data);

        // The run is contiguous across all three blocks.
        let (avail, start) = sparse.available_range(0, 4 * 4096).unwrap();
        assert_eq!(start, 2048);
        assert_eq!(avail, 8192);
    }

    #[test]
    fn test_read_stops_at_gap() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 4096);
        let mut sparse = SparseIndex::new(config, 0xBEEF);

        sparse.write(0, &[3u8; 100]).unwrap();
        sparse.write(200, &[4u8; 100]).unwrap();

        let out = sparse.read(0, 300).unwrap();
        assert_eq!(out, vec![3u8; 100]);

        // Reading from an unpopulated offset returns nothing.
        assert!(sparse.read(100, 50).unwrap().is_empty());
    }

    #[test]
    fn test_children_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 4096);

        let mut sparse = SparseIndex::new(config.clone(), 0xCAFE);
        sparse.write(1000, b"persisted across sessions").unwrap();
        sparse.close_all().unwrap();

        let mut sparse = SparseIndex::new(config, 0xCAFE);
        assert_eq!(sparse.read(1000, 25).unwrap(), b"persisted across sessions");
        let (avail, start) = sparse.available_range(0, 4096).unwrap();
        assert_eq!(start, 1000);
        assert_eq!(avail, 25);
    }

    #[test]
    fn test_corrupt_child_reads_as_zero_and_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 4096);

        let mut sparse = SparseIndex::new(config.clone(), 0xD00D);
        sparse.write(0, &[9u8; 64]).unwrap();
        sparse.close_all().unwrap();

        // Wreck the child's header magic.
        let path = dir.path().join(child_file_name(0xD00D, 0));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"NOTMAGIC").unwrap();

        let mut sparse = SparseIndex::new(config.clone(), 0xD00D);
        assert!(sparse.read(0, 64).unwrap().is_empty());

        // A fresh write recreates the block from scratch.
        sparse.write(0, &[5u8; 8]).unwrap();
        assert_eq!(sparse.read(0, 8).unwrap(), vec![5u8; 8]);
        sparse.close_all().unwrap();

        let mut sparse = SparseIndex::new(config, 0xD00D);
        assert_eq!(sparse.read(0, 8).unwrap(), vec![5u8; 8]);
    }

    #[test]
    fn test_corrupted_child_data_fails_checksum_and_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, 4096);

        let mut sparse = SparseIndex::new(config.clone(), 0xA11CE);
        sparse.write(16, &[6u8; 32]).unwrap();
        sparse.close_all().unwrap();

        // Flip a populated data byte; the range table CRC catches it.
        let path = dir.path().join(child_file_name(0xA11CE, 0));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(CHILD_DATA_BASE + 20)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let mut sparse = SparseIndex::new(config, 0xA11CE);
        assert!(sparse.read(16, 32).unwrap().is_empty());
    }
}
