use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::format::{
    EntryHeader, StreamTrailer, ENTRY_HEADER_SIZE, HEADER_FLAGS_OFFSET, HEADER_FLAG_HAS_SPARSE,
    MAX_KEY_LEN, TRAILER_SIZE,
};
use crate::entry::{
    child_file_prefix, primary_file_name, secondary_file_name, EntryMetadata, STREAM_COUNT,
};
use crate::error::Result;
use crate::hasher::{EntryHash, StreamHasher};
use crate::Error;

const ZERO_CHUNK: usize = 64 * 1024;
const SCAN_CHUNK: usize = 64 * 1024;

/// Per-stream checksum coverage for the current session. A stream keeps its
/// CRC only while every write lands exactly at the end of the checksummed
/// prefix; anything else forfeits the corruption check until the stream is
/// rewritten from offset zero.
#[derive(Debug, Clone, Copy)]
enum CrcTrack {
    Sequential(StreamHasher),
    Disabled,
}

impl CrcTrack {
    fn note_write(&mut self, offset: u64, data: &[u8], truncate: bool) {
        if truncate && offset == 0 {
            let mut hasher = StreamHasher::new();
            hasher.update(data);
            *self = CrcTrack::Sequential(hasher);
            return;
        }
        match self {
            // A truncate landing at the covered end leaves the size equal
            // to the covered prefix, so coverage stands either way.
            CrcTrack::Sequential(hasher) if offset == hasher.covered() => hasher.update(data),
            _ => *self = CrcTrack::Disabled,
        }
    }

    fn trailer_for(&self, stream_size: u64) -> StreamTrailer {
        match self {
            CrcTrack::Sequential(hasher) if hasher.covered() == stream_size => {
                StreamTrailer::with_crc(hasher.value(), stream_size)
            }
            _ => StreamTrailer::without_crc(stream_size),
        }
    }
}

/// The persistence engine for one entry. Owns the backing descriptors and
/// performs all physical I/O; runs only on the worker execution context,
/// never on a caller's task.
///
/// Stream 0 is held in memory for the session and written before its
/// trailer at close; streams 1 and 2 are written incrementally at a fixed
/// base offset in their files.
pub struct EntryStore {
    config: Arc<CacheConfig>,
    hash: EntryHash,
    key: Vec<u8>,
    primary: File,
    secondary: Option<File>,
    stream0: Vec<u8>,
    sizes: [u64; STREAM_COUNT],
    crc: [CrcTrack; STREAM_COUNT],
    header_flags: u32,
    doomed: bool,
    meta: EntryMetadata,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("hash", &format_args!("{:016x}", self.hash))
            .field("sizes", &self.sizes)
            .field("doomed", &self.doomed)
            .finish()
    }
}

impl EntryStore {
    /// Creates the backing files for a fresh entry: header and key go to
    /// the primary file; per-stream files appear only on their first
    /// non-trivial write. Leftovers from a crashed process under the same
    /// hash are removed first.
    pub fn create(config: Arc<CacheConfig>, key: &[u8], hash: EntryHash) -> Result<Self> {
        if key.len() as u64 > MAX_KEY_LEN as u64 {
            return Err(Error::InvalidArgument("key too long"));
        }

        let path = config.dir.join(primary_file_name(hash));
        if path.exists() {
            tracing::warn!(hash = %format_args!("{:016x}", hash), "Removing stale backing files");
            remove_backing_files(&config.dir, hash, true)?;
        }

        let mut primary = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = EntryHeader::new(key.len() as u32, 0);
        primary.write_all(&header.encode())?;
        primary.write_all(key)?;

        tracing::debug!(hash = %format_args!("{:016x}", hash), "Created entry");

        Ok(Self {
            config,
            hash,
            key: key.to_vec(),
            primary,
            secondary: None,
            stream0: Vec::new(),
            sizes: [0; STREAM_COUNT],
            crc: [CrcTrack::Sequential(StreamHasher::new()); STREAM_COUNT],
            header_flags: 0,
            doomed: false,
            meta: EntryMetadata::now(),
        })
    }

    /// Opens an existing entry and validates it: header magic and version,
    /// key bytes (the declared key length is bounded against the real file
    /// size before any key byte is read), trailer arithmetic, and each
    /// stream's accumulated CRC-32 where the trailer carries one.
    ///
    /// A stream whose CRC disagrees with its content does not fail the
    /// open; it is reported in the returned per-stream error array and
    /// poisons reads of that stream. Malformed records fail the open with
    /// `Corrupt`.
    pub fn open(
        config: Arc<CacheConfig>,
        key: &[u8],
        hash: EntryHash,
        had_index_hint: bool,
    ) -> Result<(Self, [Option<Error>; STREAM_COUNT])> {
        let path = config.dir.join(primary_file_name(hash));
        let mut primary = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };

        let file_len = primary.metadata()?.len();
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
        if file_len < ENTRY_HEADER_SIZE as u64 {
            return Err(Error::Corrupt("file too short for header".into()));
        }
        primary.read_exact(&mut header_buf)?;
        let header = EntryHeader::decode(&header_buf)?;

        let key_len = header.key_len as u64;
        let min_len = ENTRY_HEADER_SIZE as u64 + key_len + 2 * TRAILER_SIZE as u64;
        if min_len > file_len {
            return Err(Error::Corrupt(
                "declared key length reads past end of file".into(),
            ));
        }

        let mut stored_key = vec![0u8; header.key_len as usize];
        primary.read_exact(&mut stored_key)?;
        if stored_key != key {
            // Hash collision or a foreign file under our name; the index
            // treats this as a missing entry and evicts.
            return Err(Error::NotFound);
        }

        let data_base = ENTRY_HEADER_SIZE as u64 + key_len;

        // Trailer for stream 0 sits at the very end of the file.
        let trailer0 = read_trailer(&mut primary, file_len - TRAILER_SIZE as u64)?;
        let s0_size = trailer0.stream_size;
        if s0_size > config.max_stream0_size {
            return Err(Error::Corrupt("stream 0 larger than configured cap".into()));
        }

        let t1_pos = file_len
            .checked_sub(2 * TRAILER_SIZE as u64 + s0_size)
            .filter(|pos| *pos >= data_base)
            .ok_or_else(|| Error::Corrupt("trailer sizes disagree with file length".into()))?;
        let trailer1 = read_trailer(&mut primary, t1_pos)?;
        let s1_size = trailer1.stream_size;
        if data_base + s1_size != t1_pos {
            return Err(Error::Corrupt("stream sizes disagree with file length".into()));
        }

        let mut stream0 = vec![0u8; s0_size as usize];
        primary.seek(SeekFrom::Start(t1_pos + TRAILER_SIZE as u64))?;
        primary.read_exact(&mut stream0)?;

        let mut poison: [Option<Error>; STREAM_COUNT] = [None, None, None];

        if trailer0.has_crc() {
            let mut hasher = StreamHasher::new();
            hasher.update(&stream0);
            if hasher.value() != trailer0.crc32 {
                tracing::warn!(
                    hash = %format_args!("{:016x}", hash),
                    stream = 0,
                    "Stream checksum mismatch"
                );
                poison[0] = Some(Error::ChecksumMismatch);
            }
        }

        let crc1 = match scan_stream_crc(&mut primary, data_base, s1_size, &trailer1)? {
            CrcOutcome::Valid(hasher) => CrcTrack::Sequential(hasher),
            CrcOutcome::Mismatch => {
                tracing::warn!(
                    hash = %format_args!("{:016x}", hash),
                    stream = 1,
                    "Stream checksum mismatch"
                );
                poison[1] = Some(Error::ChecksumMismatch);
                CrcTrack::Disabled
            }
            CrcOutcome::NotChecked => CrcTrack::Disabled,
        };

        let mut sizes = [s0_size, s1_size, 0];

        // Secondary file: absent is normal; empty is leftover garbage and
        // removed here; otherwise it must validate like the primary.
        let sec_path = config.dir.join(secondary_file_name(hash));
        let mut secondary = None;
        let mut crc2 = CrcTrack::Sequential(StreamHasher::new());
        match OpenOptions::new().read(true).write(true).open(&sec_path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
            Ok(mut file) => {
                let sec_len = file.metadata()?.len();
                if sec_len == 0 {
                    drop(file);
                    fs::remove_file(&sec_path)?;
                    tracing::warn!(
                        hash = %format_args!("{:016x}", hash),
                        "Removed empty auxiliary stream file"
                    );
                } else {
                    let (s2_size, crc) =
                        open_secondary(&mut file, sec_len, key, hash, &mut poison)?;
                    sizes[2] = s2_size;
                    crc2 = crc;
                    secondary = Some(file);
                }
            }
        }

        let meta = metadata_from_file(&primary);
        tracing::debug!(
            hash = %format_args!("{:016x}", hash),
            had_index_hint,
            sizes = ?sizes,
            "Opened entry"
        );

        Ok((
            Self {
                config,
                hash,
                key: key.to_vec(),
                primary,
                secondary,
                stream0,
                sizes,
                crc: [CrcTrack::Disabled, crc1, crc2],
                header_flags: header.flags,
                doomed: false,
                meta,
            },
            poison,
        ))
    }

    pub fn hash(&self) -> EntryHash {
        self.hash
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn sizes(&self) -> [u64; STREAM_COUNT] {
        self.sizes
    }

    pub fn metadata(&self) -> EntryMetadata {
        self.meta
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    pub fn has_sparse(&self) -> bool {
        self.header_flags & HEADER_FLAG_HAS_SPARSE != 0
    }

    fn data_base(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64 + self.key.len() as u64
    }

    /// Reads up to `len` bytes of a stream at `offset`. Reads at or beyond
    /// the current size return no bytes; gaps below the size read as
    /// zeros.
    pub fn read(&mut self, stream: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        if stream >= STREAM_COUNT {
            return Err(Error::InvalidArgument("stream index out of range"));
        }
        self.meta.touch_used();

        let size = self.sizes[stream];
        if offset >= size {
            return Ok(Vec::new());
        }
        let n = (size - offset).min(len as u64) as usize;

        match stream {
            0 => Ok(self.stream0[offset as usize..offset as usize + n].to_vec()),
            1 => {
                let base = self.data_base();
                read_region(&mut self.primary, base + offset, n)
            }
            _ => match &mut self.secondary {
                // A size established by zero-length writes with no backing
                // file reads as zeros.
                None => Ok(vec![0u8; n]),
                Some(file) => {
                    let base = ENTRY_HEADER_SIZE as u64 + self.key.len() as u64;
                    read_region(file, base + offset, n)
                }
            },
        }
    }

    /// Writes `data` to a stream at `offset`. With `truncate`, the stream
    /// size becomes exactly `offset + data.len()`; without it the size only
    /// grows, and any gap between the old size and `offset` is zero-filled.
    /// Zero-length writes adjust the size without materializing a file.
    pub fn write(
        &mut self,
        stream: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        if stream >= STREAM_COUNT {
            return Err(Error::InvalidArgument("stream index out of range"));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::InvalidArgument("offset overflow"))?;
        self.meta.touch_modified();

        match stream {
            0 => {
                if end > self.config.max_stream0_size {
                    return Err(Error::InvalidArgument("stream 0 too large"));
                }
                let off = offset as usize;
                if truncate {
                    self.stream0.resize(off, 0);
                    self.stream0.extend_from_slice(data);
                } else {
                    if end as usize > self.stream0.len() {
                        self.stream0.resize(end as usize, 0);
                    }
                    self.stream0[off..off + data.len()].copy_from_slice(data);
                }
                self.sizes[0] = self.stream0.len() as u64;
            }
            1 => {
                let base = self.data_base();
                write_stream_region(&mut self.primary, base, self.sizes[1], offset, data)?;
                self.crc[1].note_write(offset, data, truncate);
                self.sizes[1] = if truncate { end } else { self.sizes[1].max(end) };
            }
            _ => {
                if !data.is_empty() {
                    self.ensure_secondary()?;
                }
                if let Some(file) = &mut self.secondary {
                    let base = ENTRY_HEADER_SIZE as u64 + self.key.len() as u64;
                    write_stream_region(file, base, self.sizes[2], offset, data)?;
                }
                self.crc[2].note_write(offset, data, truncate);
                self.sizes[2] = if truncate { end } else { self.sizes[2].max(end) };
            }
        }
        Ok(data.len())
    }

    fn ensure_secondary(&mut self) -> Result<()> {
        if self.secondary.is_some() {
            return Ok(());
        }
        let path = self.config.dir.join(secondary_file_name(self.hash));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if self.doomed {
            // The entry is already doomed; the stream stays usable through
            // the descriptor but the file must not outlive the session.
            let _ = fs::remove_file(&path);
        }
        let header = EntryHeader::new(self.key.len() as u32, 0);
        file.write_all(&header.encode())?;
        file.write_all(&self.key)?;
        self.secondary = Some(file);
        Ok(())
    }

    /// Marks the entry as holding sparse children, flipping the header flag
    /// in place so a later doom of the closed entry knows to scan for child
    /// files.
    pub fn set_has_sparse(&mut self) -> Result<()> {
        if self.has_sparse() {
            return Ok(());
        }
        self.header_flags |= HEADER_FLAG_HAS_SPARSE;
        self.primary.seek(SeekFrom::Start(HEADER_FLAGS_OFFSET))?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.header_flags.to_be_bytes());
        self.primary.write_all(&buf)?;
        Ok(())
    }

    /// Writes the trailer records and releases the descriptors. A doomed
    /// entry's files are already unlinked; its descriptors are simply
    /// dropped.
    pub fn close(mut self) -> Result<()> {
        if self.doomed {
            return Ok(());
        }

        let mut pos = self.data_base() + self.sizes[1];
        self.primary.seek(SeekFrom::Start(pos))?;
        let trailer1 = self.crc[1].trailer_for(self.sizes[1]);
        self.primary.write_all(&trailer1.encode())?;
        pos += TRAILER_SIZE as u64;

        self.primary.write_all(&self.stream0)?;
        pos += self.stream0.len() as u64;

        let mut hasher = StreamHasher::new();
        hasher.update(&self.stream0);
        let trailer0 = StreamTrailer::with_crc(hasher.value(), self.stream0.len() as u64);
        self.primary.write_all(&trailer0.encode())?;
        pos += TRAILER_SIZE as u64;

        self.primary.set_len(pos)?;
        if self.config.sync_on_close {
            self.primary.sync_all()?;
        }

        if let Some(mut file) = self.secondary.take() {
            let base = ENTRY_HEADER_SIZE as u64 + self.key.len() as u64;
            let end = base + self.sizes[2];
            file.seek(SeekFrom::Start(end))?;
            let trailer2 = self.crc[2].trailer_for(self.sizes[2]);
            file.write_all(&trailer2.encode())?;
            file.set_len(end + TRAILER_SIZE as u64)?;
            if self.config.sync_on_close {
                file.sync_all()?;
            }
        }

        tracing::debug!(hash = %format_args!("{:016x}", self.hash), "Closed entry");
        Ok(())
    }

    /// Unlinks every backing file for this entry. Open descriptors keep
    /// working, so handles sharing the entry continue until they close.
    pub fn doom(&mut self) -> Result<()> {
        if self.doomed {
            return Ok(());
        }
        remove_backing_files(&self.config.dir, self.hash, self.has_sparse())?;
        self.doomed = true;
        tracing::debug!(hash = %format_args!("{:016x}", self.hash), "Doomed entry");
        Ok(())
    }
}

enum CrcOutcome {
    Valid(StreamHasher),
    Mismatch,
    NotChecked,
}

fn scan_stream_crc(
    file: &mut File,
    base: u64,
    size: u64,
    trailer: &StreamTrailer,
) -> Result<CrcOutcome> {
    if !trailer.has_crc() {
        return Ok(CrcOutcome::NotChecked);
    }
    let mut hasher = StreamHasher::new();
    let mut remaining = size;
    let mut chunk = vec![0u8; SCAN_CHUNK];
    file.seek(SeekFrom::Start(base))?;
    while remaining > 0 {
        let n = remaining.min(SCAN_CHUNK as u64) as usize;
        file.read_exact(&mut chunk[..n])?;
        hasher.update(&chunk[..n]);
        remaining -= n as u64;
    }
    if hasher.value() == trailer.crc32 {
        Ok(CrcOutcome::Valid(hasher))
    } else {
        Ok(CrcOutcome::Mismatch)
    }
}

fn open_secondary(
    file: &mut File,
    file_len: u64,
    key: &[u8],
    hash: EntryHash,
    poison: &mut [Option<Error>; STREAM_COUNT],
) -> Result<(u64, CrcTrack)> {
    let mut header_buf = [0u8; ENTRY_HEADER_SIZE];
    if file_len < ENTRY_HEADER_SIZE as u64 {
        return Err(Error::Corrupt("auxiliary file too short for header".into()));
    }
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_buf)?;
    let header = EntryHeader::decode(&header_buf)?;

    let key_len = header.key_len as u64;
    if ENTRY_HEADER_SIZE as u64 + key_len + TRAILER_SIZE as u64 > file_len {
        return Err(Error::Corrupt(
            "declared key length reads past end of auxiliary file".into(),
        ));
    }
    let mut stored_key = vec![0u8; header.key_len as usize];
    file.read_exact(&mut stored_key)?;
    if stored_key != key {
        return Err(Error::NotFound);
    }

    let base = ENTRY_HEADER_SIZE as u64 + key_len;
    let trailer = read_trailer(file, file_len - TRAILER_SIZE as u64)?;
    if base + trailer.stream_size + TRAILER_SIZE as u64 != file_len {
        return Err(Error::Corrupt(
            "auxiliary stream size disagrees with file length".into(),
        ));
    }

    let crc = match scan_stream_crc(file, base, trailer.stream_size, &trailer)? {
        CrcOutcome::Valid(hasher) => CrcTrack::Sequential(hasher),
        CrcOutcome::Mismatch => {
            tracing::warn!(
                hash = %format_args!("{:016x}", hash),
                stream = 2,
                "Stream checksum mismatch"
            );
            poison[2] = Some(Error::ChecksumMismatch);
            CrcTrack::Disabled
        }
        CrcOutcome::NotChecked => CrcTrack::Disabled,
    };
    Ok((trailer.stream_size, crc))
}

fn read_trailer(file: &mut File, pos: u64) -> Result<StreamTrailer> {
    let mut buf = [0u8; TRAILER_SIZE];
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(&mut buf)?;
    StreamTrailer::decode(&buf)
}

fn read_region(file: &mut File, pos: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes `data` at `base + offset`, first zero-filling any gap between the
/// current logical size and `offset` so stale bytes from a previous session
/// can never leak into a read.
fn write_stream_region(
    file: &mut File,
    base: u64,
    current_size: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if offset > current_size {
        let mut remaining = offset - current_size;
        let zeros = vec![0u8; ZERO_CHUNK.min(remaining as usize)];
        file.seek(SeekFrom::Start(base + current_size))?;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
    }
    if !data.is_empty() {
        file.seek(SeekFrom::Start(base + offset))?;
        file.write_all(data)?;
    }
    Ok(())
}

fn remove_one(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Unlinks the primary and secondary files for `hash` and, when the entry
/// holds sparse data, every child file under its prefix. Succeeds when all
/// files are removed or were already absent.
pub(crate) fn remove_backing_files(dir: &Path, hash: EntryHash, scan_children: bool) -> Result<()> {
    remove_one(&dir.join(primary_file_name(hash)))?;
    remove_one(&dir.join(secondary_file_name(hash)))?;
    if scan_children {
        let prefix = child_file_prefix(hash);
        for dirent in fs::read_dir(dir)? {
            let dirent = dirent?;
            if dirent
                .file_name()
                .to_str()
                .map_or(false, |name| name.starts_with(&prefix))
            {
                remove_one(&dirent.path())?;
            }
        }
    }
    Ok(())
}

/// Removes the backing files of an entry that is not open. The primary
/// header is consulted for the sparse flag; an unreadable header falls back
/// to a full child scan.
pub(crate) fn doom_files(dir: &Path, hash: EntryHash) -> Result<()> {
    let scan_children = match fs::File::open(dir.join(primary_file_name(hash))) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(_) => true,
        Ok(mut file) => {
            let mut buf = [0u8; ENTRY_HEADER_SIZE];
            match file.read_exact(&mut buf) {
                Ok(()) => match EntryHeader::decode(&buf) {
                    Ok(header) => header.flags & HEADER_FLAG_HAS_SPARSE != 0,
                    Err(_) => true,
                },
                Err(_) => true,
            }
        }
    };
    remove_backing_files(dir, hash, scan_children)
}

fn metadata_from_file(file: &File) -> EntryMetadata {
    let now = std::time::SystemTime::now();
    match file.metadata() {
        Ok(meta) => EntryMetadata {
            last_used: meta.accessed().unwrap_or(now),
            last_modified: meta.modified().unwrap_or(now),
        },
        Err(_) => EntryMetadata {
            last_used: now,
            last_modified: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::KeyHasher;
    use std::io::{Seek, SeekFrom, Write};

    fn test_config(dir: &tempfile::TempDir) -> Arc<CacheConfig> {
        Arc::new(CacheConfig::new(dir.path()))
    }

    fn create_store(config: &Arc<CacheConfig>, key: &[u8]) -> EntryStore {
        let hash = KeyHasher::new().hash(key);
        EntryStore::create(config.clone(), key, hash).expect("Failed to create entry")
    }

    fn reopen(
        config: &Arc<CacheConfig>,
        key: &[u8],
    ) -> (EntryStore, [Option<Error>; STREAM_COUNT]) {
        let hash = KeyHasher::new().hash(key);
        EntryStore::open(config.clone(), key, hash, false).expect("Failed to open entry")
    }

    #[test]
    fn test_create_close_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut data = b"the data".to_vec();
        data.resize(10, 0);

        let mut store = create_store(&config, b"k");
        store.write(0, 0, &data, false).unwrap();
        store.close().unwrap();

        let (mut store, poison) = reopen(&config, b"k");
        assert!(poison.iter().all(|p| p.is_none()));
        assert_eq!(store.sizes()[0], 10);
        assert_eq!(store.read(0, 0, 10).unwrap(), data);
    }

    #[test]
    fn test_truncate_redefines_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let big: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let small: Vec<u8> = (0..200u32).map(|i| (i % 13) as u8).collect();

        let mut store = create_store(&config, b"k");
        store.write(0, 0, &big, false).unwrap();
        store.write(0, 0, &small, true).unwrap();
        assert_eq!(store.sizes()[0], 200);
        store.close().unwrap();

        let (mut store, _) = reopen(&config, b"k");
        assert_eq!(store.sizes()[0], 200);
        assert_eq!(store.read(0, 0, 200).unwrap(), small);
    }

    #[test]
    fn test_zero_length_truncate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"k");
        for _ in 0..3 {
            store.write(0, 50, &[], true).unwrap();
            assert_eq!(store.sizes()[0], 50);
        }
        // The gap below the size reads as zeros.
        assert_eq!(store.read(0, 10, 20).unwrap(), vec![0u8; 20]);
    }

    #[test]
    fn test_body_stream_roundtrip_and_gap_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"body");
        store.write(1, 100, b"hello", false).unwrap();
        assert_eq!(store.sizes()[1], 105);

        assert_eq!(store.read(1, 0, 100).unwrap(), vec![0u8; 100]);
        assert_eq!(store.read(1, 100, 5).unwrap(), b"hello");
        // At or beyond the size: zero bytes read, never an error.
        assert!(store.read(1, 105, 10).unwrap().is_empty());
        assert!(store.read(1, 9999, 1).unwrap().is_empty());
    }

    #[test]
    fn test_nontruncating_write_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"k");
        store.write(1, 0, &[7u8; 100], false).unwrap();
        store.write(1, 10, &[8u8; 5], false).unwrap();
        assert_eq!(store.sizes()[1], 100);
    }

    #[test]
    fn test_sequential_writes_keep_crc_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"k");
        store.write(1, 0, b"abcd", false).unwrap();
        store.write(1, 4, b"efgh", false).unwrap();
        store.close().unwrap();

        // Corrupt one body byte on disk; the CRC was written, so the next
        // open must notice.
        let path = dir.path().join(primary_file_name(KeyHasher::new().hash(b"k")));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(ENTRY_HEADER_SIZE as u64 + 1 + 2))
            .unwrap();
        file.write_all(b"X").unwrap();

        let hash = KeyHasher::new().hash(b"k");
        let (_store, poison) = EntryStore::open(config, b"k", hash, false).unwrap();
        assert!(matches!(poison[1], Some(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_non_sequential_write_forfeits_crc() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"k");
        store.write(1, 0, &[1u8; 16], false).unwrap();
        // Lands inside the checksummed prefix: CRC is off for this session.
        store.write(1, 4, &[2u8; 4], false).unwrap();
        store.close().unwrap();

        // Corrupt a body byte; with no CRC in the trailer the next open has
        // nothing to check against and the stream is not poisoned.
        let path = dir.path().join(primary_file_name(KeyHasher::new().hash(b"k")));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(ENTRY_HEADER_SIZE as u64 + 1 + 8))
            .unwrap();
        file.write_all(b"X").unwrap();

        let (_store, poison) = reopen(&config, b"k");
        assert!(poison[1].is_none());
    }

    #[test]
    fn test_truncate_to_zero_restores_crc() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"k");
        store.write(1, 8, &[1u8; 8], false).unwrap(); // non-sequential start
        store.write(1, 0, b"fresh", true).unwrap(); // rewrite from zero
        store.close().unwrap();

        let (mut store, poison) = reopen(&config, b"k");
        assert!(poison[1].is_none());
        assert_eq!(store.read(1, 0, 5).unwrap(), b"fresh");

        // Prove the trailer carried a CRC this time: corruption is caught.
        drop(store);
        let path = dir.path().join(primary_file_name(KeyHasher::new().hash(b"k")));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(ENTRY_HEADER_SIZE as u64 + 1))
            .unwrap();
        file.write_all(b"Z").unwrap();
        let (_store, poison) = reopen(&config, b"k");
        assert!(matches!(poison[1], Some(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_corrupt_header_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let store = create_store(&config, b"k");
        store.close().unwrap();

        let path = dir.path().join(primary_file_name(KeyHasher::new().hash(b"k")));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"GARBAGE!").unwrap();

        let hash = KeyHasher::new().hash(b"k");
        assert!(matches!(
            EntryStore::open(config, b"k", hash, false),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let store = create_store(&config, b"k");
        store.close().unwrap();

        let path = dir.path().join(primary_file_name(KeyHasher::new().hash(b"k")));
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(ENTRY_HEADER_SIZE as u64).unwrap();

        let hash = KeyHasher::new().hash(b"k");
        assert!(matches!(
            EntryStore::open(config, b"k", hash, false),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_key_mismatch_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let store = create_store(&config, b"original");
        let hash = store.hash();
        store.close().unwrap();

        // Same hash, different key: a collision reads as a missing entry.
        assert!(matches!(
            EntryStore::open(config, b"intruder", hash, false),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_open_missing_entry_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        assert!(matches!(
            EntryStore::open(config, b"nope", 0x1234, false),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_auxiliary_stream_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"aux");
        store.write(2, 0, b"auxiliary bytes", false).unwrap();
        store.close().unwrap();

        let (mut store, poison) = reopen(&config, b"aux");
        assert!(poison[2].is_none());
        assert_eq!(store.sizes()[2], 15);
        assert_eq!(store.read(2, 0, 15).unwrap(), b"auxiliary bytes");
    }

    #[test]
    fn test_zero_length_write_never_materializes_auxiliary_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"aux");
        store.write(2, 0, &[], false).unwrap();
        store.write(2, 50, &[], true).unwrap();
        assert_eq!(store.sizes()[2], 50);
        assert_eq!(store.read(2, 0, 10).unwrap(), vec![0u8; 10]);
        let hash = store.hash();
        store.close().unwrap();

        assert!(!dir.path().join(secondary_file_name(hash)).exists());
    }

    #[test]
    fn test_empty_auxiliary_file_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let store = create_store(&config, b"aux");
        let hash = store.hash();
        store.close().unwrap();

        let sec_path = dir.path().join(secondary_file_name(hash));
        File::create(&sec_path).unwrap();

        let (_store, _) = reopen(&config, b"aux");
        assert!(!sec_path.exists());
    }

    #[test]
    fn test_doom_removes_files_but_descriptors_survive() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"doomed");
        store.write(1, 0, b"still readable", false).unwrap();
        let hash = store.hash();
        store.doom().unwrap();

        assert!(!dir.path().join(primary_file_name(hash)).exists());
        assert_eq!(store.read(1, 0, 14).unwrap(), b"still readable");
        store.close().unwrap();
    }

    #[test]
    fn test_doom_files_for_unopened_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"gone");
        store.write(1, 0, b"x", false).unwrap();
        let hash = store.hash();
        store.close().unwrap();

        doom_files(&config.dir, hash).unwrap();
        assert!(!dir.path().join(primary_file_name(hash)).exists());

        // Dooming an absent entry succeeds.
        doom_files(&config.dir, hash).unwrap();
    }

    #[test]
    fn test_create_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"stale");
        store.write(1, 0, &[9u8; 64], false).unwrap();
        let hash = store.hash();
        store.close().unwrap();

        // A second create under the same key starts from scratch.
        let mut store = create_store(&config, b"stale");
        assert_eq!(store.sizes()[1], 0);
        store.write(1, 0, b"new", false).unwrap();
        store.close().unwrap();

        let (mut store, _) = reopen(&config, b"stale");
        assert_eq!(store.sizes()[1], 3);
        assert_eq!(store.read(1, 0, 3).unwrap(), b"new");
        let _ = hash;
    }

    #[test]
    fn test_timestamps_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut store = create_store(&config, b"ts");
        let before = store.metadata();
        store.write(1, 0, b"x", false).unwrap();
        let after_write = store.metadata();
        assert!(after_write.last_modified >= before.last_modified);

        store.read(1, 0, 1).unwrap();
        let after_read = store.metadata();
        assert!(after_read.last_used >= after_write.last_used);
    }
}
