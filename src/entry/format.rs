use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

pub const ENTRY_HEADER_SIZE: usize = 24;
pub const TRAILER_SIZE: usize = 24;
pub const RANGE_TABLE_HEADER_SIZE: usize = 20;
pub const RANGE_ENTRY_SIZE: usize = 8;

/// Keys longer than this are rejected at create time and treated as
/// corruption when declared by an on-disk header.
pub const MAX_KEY_LEN: u32 = 64 * 1024;

const ENTRY_MAGIC: &[u8; 8] = b"CINDR\x00EN";
const TRAILER_MAGIC: &[u8; 8] = b"CINDR\x00EF";
const RANGE_MAGIC: &[u8; 8] = b"CINDR\x00RT";
const VERSION: u32 = 1;

/// Header flag: the entry has (or once had) sparse children on disk, so a
/// doom must scan for child files.
pub const HEADER_FLAG_HAS_SPARSE: u32 = 1 << 0;

/// Trailer flag: the crc32 field holds a valid checksum of the stream.
pub const TRAILER_FLAG_HAS_CRC: u32 = 1 << 0;

/// Byte offset of the flags word within an encoded header. The sparse flag
/// is flipped in place once the first child is created.
pub const HEADER_FLAGS_OFFSET: u64 = 16;

/// Leading record of every backing file: magic, format version, length of
/// the key bytes that follow, and entry-level flags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub key_len: u32,
    pub flags: u32,
}

impl EntryHeader {
    pub fn new(key_len: u32, flags: u32) -> Self {
        Self {
            magic: *ENTRY_MAGIC,
            version: VERSION,
            key_len,
            flags,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *ENTRY_MAGIC {
            return Err(Error::Corrupt("bad header magic".into()));
        }
        if self.version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        if self.key_len > MAX_KEY_LEN {
            return Err(Error::Corrupt(format!(
                "declared key length {} exceeds maximum",
                self.key_len
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        (&mut buf[8..12]).write_u32::<BigEndian>(self.version).unwrap();
        (&mut buf[12..16]).write_u32::<BigEndian>(self.key_len).unwrap();
        (&mut buf[16..20]).write_u32::<BigEndian>(self.flags).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(Error::Corrupt("file too short for header".into()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        let key_len = (&buf[12..16]).read_u32::<BigEndian>()?;
        let flags = (&buf[16..20]).read_u32::<BigEndian>()?;

        let header = Self {
            magic,
            version,
            key_len,
            flags,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Per-stream record written when a stream's file region is finalized:
/// magic, a CRC-present flag, the checksum (valid only when flagged), and
/// the size of the stream ending at this trailer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamTrailer {
    pub magic: [u8; 8],
    pub flags: u32,
    pub crc32: u32,
    pub stream_size: u64,
}

impl StreamTrailer {
    pub fn with_crc(crc32: u32, stream_size: u64) -> Self {
        Self {
            magic: *TRAILER_MAGIC,
            flags: TRAILER_FLAG_HAS_CRC,
            crc32,
            stream_size,
        }
    }

    /// A trailer for a stream whose write sequence was not sequential from
    /// offset zero; the corruption check is forfeited for the next open.
    pub fn without_crc(stream_size: u64) -> Self {
        Self {
            magic: *TRAILER_MAGIC,
            flags: 0,
            crc32: 0,
            stream_size,
        }
    }

    pub fn has_crc(&self) -> bool {
        self.flags & TRAILER_FLAG_HAS_CRC != 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *TRAILER_MAGIC {
            return Err(Error::Corrupt("bad trailer magic".into()));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut buf = [0u8; TRAILER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        (&mut buf[8..12]).write_u32::<BigEndian>(self.flags).unwrap();
        (&mut buf[12..16]).write_u32::<BigEndian>(self.crc32).unwrap();
        (&mut buf[16..24]).write_u64::<BigEndian>(self.stream_size).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TRAILER_SIZE {
            return Err(Error::Corrupt("file too short for trailer".into()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let flags = (&buf[8..12]).read_u32::<BigEndian>()?;
        let crc32 = (&buf[12..16]).read_u32::<BigEndian>()?;
        let stream_size = (&buf[16..24]).read_u64::<BigEndian>()?;

        let trailer = Self {
            magic,
            flags,
            crc32,
            stream_size,
        };
        trailer.validate()?;
        Ok(trailer)
    }
}

/// Populated-run table of a sparse child, appended after the child's data
/// region on close: magic, CRC-present flag, checksum over the populated
/// bytes in run order, and the sorted, non-overlapping runs themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeTable {
    pub flags: u32,
    pub crc32: u32,
    /// (offset, len) pairs within the block, ascending, coalesced.
    pub ranges: Vec<(u32, u32)>,
}

impl RangeTable {
    pub fn new(crc32: u32, ranges: Vec<(u32, u32)>) -> Self {
        Self {
            flags: TRAILER_FLAG_HAS_CRC,
            crc32,
            ranges,
        }
    }

    pub fn has_crc(&self) -> bool {
        self.flags & TRAILER_FLAG_HAS_CRC != 0
    }

    pub fn encoded_len(&self) -> usize {
        RANGE_TABLE_HEADER_SIZE + self.ranges.len() * RANGE_ENTRY_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(RANGE_MAGIC);
        buf.write_u32::<BigEndian>(self.flags).unwrap();
        buf.write_u32::<BigEndian>(self.crc32).unwrap();
        buf.write_u32::<BigEndian>(self.ranges.len() as u32).unwrap();
        for &(offset, len) in &self.ranges {
            buf.write_u32::<BigEndian>(offset).unwrap();
            buf.write_u32::<BigEndian>(len).unwrap();
        }
        buf
    }

    /// Decodes and validates a range table against the child's block size.
    /// The declared count is bounded against the actual buffer before any
    /// entry is read.
    pub fn decode(buf: &[u8], block_size: u64) -> Result<Self> {
        if buf.len() < RANGE_TABLE_HEADER_SIZE {
            return Err(Error::Corrupt("file too short for range table".into()));
        }
        if &buf[0..8] != RANGE_MAGIC {
            return Err(Error::Corrupt("bad range table magic".into()));
        }
        let flags = (&buf[8..12]).read_u32::<BigEndian>()?;
        let crc32 = (&buf[12..16]).read_u32::<BigEndian>()?;
        let count = (&buf[16..20]).read_u32::<BigEndian>()? as usize;

        let body = &buf[RANGE_TABLE_HEADER_SIZE..];
        if count
            .checked_mul(RANGE_ENTRY_SIZE)
            .map_or(true, |need| need > body.len())
        {
            return Err(Error::Corrupt(format!(
                "range table declares {} runs past end of file",
                count
            )));
        }

        let mut ranges = Vec::with_capacity(count);
        let mut cursor = body;
        let mut prev_end = 0u64;
        for _ in 0..count {
            let offset = cursor.read_u32::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()?;
            let start = offset as u64;
            let end = start + len as u64;
            if len == 0 || start < prev_end || end > block_size {
                return Err(Error::Corrupt("range table runs out of order".into()));
            }
            prev_end = end;
            ranges.push((offset, len));
        }

        Ok(Self {
            flags,
            crc32,
            ranges,
        })
    }
}
