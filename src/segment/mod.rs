//! Immutable sorted segment files.
//!
//! A segment is the on-disk unit of the store: a sorted, checksummed,
//! self-describing run of entries produced by a memtable flush (level 0)
//! or a compaction (level 1 and deeper).  Once written it never changes;
//! compaction replaces segments wholesale.
//!
//! # File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ header: [magic "SSEG"][version u32][crc32 u32]           │
//! ├──────────────────────────────────────────────────────────┤
//! │ data block 0: [u32 len][entries…][crc32]    (~4 KiB)     │
//! │ data block 1: …                                          │
//! ├──────────────────────────────────────────────────────────┤
//! │ bloom block:      [u32 len][filter bytes][crc32]         │
//! │ properties block: [u32 len][Properties][crc32]           │
//! │ index block:      [u32 len][Vec<IndexEntry>][crc32]      │
//! ├──────────────────────────────────────────────────────────┤
//! │ footer (60 bytes): bloom/properties/index handles,       │
//! │                    file size, crc32                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries within a segment are sorted `(key ASC, seq DESC)`.  The index
//! records the first key of every data block, so a point lookup is a
//! bloom probe, one binary search, and one block scan.  Every checksum
//! failure is surfaced as corruption, never skipped.
//!
//! Readers hold [`Segment`]s through `Arc`; a file retired by compaction
//! is marked delete-on-drop and unlinked only once the last reader
//! releases its handle.

pub mod cache;
pub mod iterator;
pub mod writer;

#[cfg(test)]
mod tests;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use iterator::BlockIterator;

pub use cache::SegmentCache;
pub use writer::{SegmentStats, SegmentWriter};

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Magic bytes at offset 0 of every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"SSEG";

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Header size: magic(4) + version(4) + crc32(4).
pub const SEGMENT_HEADER_SIZE: u64 = 12;

/// Footer size: three block handles (16 each) + file size (8) + crc32 (4).
pub const SEGMENT_FOOTER_SIZE: u64 = 60;

/// Target payload size of one data block.
pub const BLOCK_TARGET_SIZE: usize = 4096;

/// Per-block framing overhead: length prefix + trailing checksum.
pub const BLOCK_FRAME_OVERHEAD: u64 = 8;

/// Bloom filter false-positive rate.
pub const BLOOM_FP_RATE: f64 = 0.01;

/// File name for a segment id, e.g. `seg-000042.seg`.
pub fn segment_file_name(id: u64) -> String {
    format!("seg-{id:06}.seg")
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced by segment reading and writing.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying file I/O failed.
    #[error("segment i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A block or meta structure failed to encode or decode.
    #[error("segment encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structural damage: bad magic, impossible handle, size mismatch.
    #[error("segment corruption: {0}")]
    Corruption(String),

    /// A stored checksum did not match the bytes it covers.
    #[error("segment checksum mismatch in {section} (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch {
        section: &'static str,
        expected: u32,
        actual: u32,
    },

    /// The bloom filter could not be built.
    #[error("bloom filter error: {0}")]
    Bloom(String),

    /// Writer input violated the required `(key ASC, seq DESC)` order.
    #[error("out-of-order segment write: {0}")]
    OutOfOrder(String),

    /// `finish` was called on a writer that received no entries.
    #[error("segment writer finished without entries")]
    Empty,
}

// ------------------------------------------------------------------------------------------------
// Meta structures
// ------------------------------------------------------------------------------------------------

/// Location of a framed block within the file.
///
/// `offset` points at the block's length prefix; `size` covers the whole
/// frame including prefix and checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (offset, mut consumed) = u64::decode_from(buf)?;
        let (size, n) = u64::decode_from(&buf[consumed..])?;
        consumed += n;
        Ok((Self { offset, size }, consumed))
    }
}

/// Index record: the first key of one data block and where to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub first_key: Vec<u8>,
    pub handle: BlockHandle,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (first_key, mut consumed) = <Vec<u8>>::decode_from(buf)?;
        let (handle, n) = BlockHandle::decode_from(&buf[consumed..])?;
        consumed += n;
        Ok((Self { first_key, handle }, consumed))
    }
}

/// Summary statistics stored in the properties block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Properties {
    pub entry_count: u64,
    pub tombstone_count: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl Encode for Properties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.entry_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.min_seq.encode_to(buf)?;
        self.max_seq.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Properties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entry_count, mut offset) = u64::decode_from(buf)?;
        let (tombstone_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                entry_count,
                tombstone_count,
                min_seq,
                max_seq,
                min_key,
                max_key,
            },
            offset,
        ))
    }
}

/// Fixed-size trailer addressing the meta blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub bloom: BlockHandle,
    pub properties: BlockHandle,
    pub index: BlockHandle,
    pub file_size: u64,
}

impl Footer {
    /// Serialize to exactly [`SEGMENT_FOOTER_SIZE`] bytes, checksum included.
    pub(crate) fn to_bytes(self) -> [u8; SEGMENT_FOOTER_SIZE as usize] {
        let mut bytes = [0u8; SEGMENT_FOOTER_SIZE as usize];
        let handles = [self.bloom, self.properties, self.index];
        for (i, handle) in handles.iter().enumerate() {
            let base = i * 16;
            bytes[base..base + 8].copy_from_slice(&handle.offset.to_le_bytes());
            bytes[base + 8..base + 16].copy_from_slice(&handle.size.to_le_bytes());
        }
        bytes[48..56].copy_from_slice(&self.file_size.to_le_bytes());
        let crc = crc32fast::hash(&bytes[..56]);
        bytes[56..60].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() != SEGMENT_FOOTER_SIZE as usize {
            return Err(SegmentError::Corruption(format!(
                "footer is {} bytes, expected {SEGMENT_FOOTER_SIZE}",
                bytes.len()
            )));
        }
        let expected = u32::from_le_bytes([bytes[56], bytes[57], bytes[58], bytes[59]]);
        let actual = crc32fast::hash(&bytes[..56]);
        if expected != actual {
            return Err(SegmentError::ChecksumMismatch {
                section: "footer",
                expected,
                actual,
            });
        }

        let handle_at = |base: usize| BlockHandle {
            offset: u64::from_le_bytes(bytes[base..base + 8].try_into().unwrap_or([0; 8])),
            size: u64::from_le_bytes(bytes[base + 8..base + 16].try_into().unwrap_or([0; 8])),
        };
        Ok(Self {
            bloom: handle_at(0),
            properties: handle_at(16),
            index: handle_at(32),
            file_size: u64::from_le_bytes(bytes[48..56].try_into().unwrap_or([0; 8])),
        })
    }
}

/// Result of a point lookup against one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentGet {
    /// The key's newest version in this segment is a live value.
    Value(Vec<u8>, u64),
    /// The key's newest version in this segment is a deletion.
    Tombstone(u64),
    /// The segment holds no version of the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Segment reader
// ------------------------------------------------------------------------------------------------

/// Read handle over one segment file, memory-mapped.
pub struct Segment {
    id: u64,
    path: PathBuf,
    mmap: Mmap,
    bloom: Option<Bloom<[u8]>>,
    properties: Properties,
    index: Vec<IndexEntry>,
    delete_on_drop: AtomicBool,
}

impl Segment {
    /// Open and fully verify a segment file.
    ///
    /// Validates the header and footer checksums and loads the bloom,
    /// properties, and index blocks (each with its own block checksum).
    pub fn open(id: u64, path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: segment files are immutable once published via rename;
        // nothing remaps or rewrites them while the store holds them.
        let mmap = unsafe { Mmap::map(&file)? };

        let min_len = SEGMENT_HEADER_SIZE + SEGMENT_FOOTER_SIZE;
        if (mmap.len() as u64) < min_len {
            return Err(SegmentError::Corruption(format!(
                "file is {} bytes, smaller than header + footer ({min_len})",
                mmap.len()
            )));
        }

        verify_header(&mmap[..SEGMENT_HEADER_SIZE as usize])?;

        let footer_start = mmap.len() - SEGMENT_FOOTER_SIZE as usize;
        let footer = Footer::from_bytes(&mmap[footer_start..])?;
        if footer.file_size != mmap.len() as u64 {
            return Err(SegmentError::Corruption(format!(
                "footer records {} bytes but file is {}",
                footer.file_size,
                mmap.len()
            )));
        }

        let bloom_bytes = framed_block(&mmap, &footer.bloom, "bloom block")?;
        let bloom = match Bloom::from_slice(bloom_bytes) {
            Ok(bloom) => Some(bloom),
            Err(error) => {
                // A filter that fails to parse only costs lookups its
                // fast path; the block checksum already passed.
                warn!(id, %error, "bloom filter rejected, lookups fall back to index");
                None
            }
        };

        let props_bytes = framed_block(&mmap, &footer.properties, "properties block")?;
        let (properties, _) = encoding::decode_from_slice::<Properties>(props_bytes)?;

        let index_bytes = framed_block(&mmap, &footer.index, "index block")?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(index_bytes)?;

        debug!(
            id,
            path = %path.display(),
            entries = properties.entry_count,
            blocks = index.len(),
            "opened segment"
        );
        Ok(Self {
            id,
            path,
            mmap,
            bloom,
            properties,
            index,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Look up the newest version of `key` within this segment.
    pub fn get(&self, key: &[u8]) -> Result<SegmentGet, SegmentError> {
        if key < self.properties.min_key.as_slice() || key > self.properties.max_key.as_slice() {
            return Ok(SegmentGet::NotFound);
        }
        if let Some(bloom) = &self.bloom
            && !bloom.check(key)
        {
            return Ok(SegmentGet::NotFound);
        }

        let Some(handle) = self.find_block_for_key(key) else {
            return Ok(SegmentGet::NotFound);
        };
        let data = self.block_data(&handle)?;

        // Entries are (key ASC, seq DESC): the first hit is the newest
        // version, and passing the key means it is absent.
        let mut iter = BlockIterator::new(data);
        while let Some(entry) = iter.next().transpose()? {
            if entry.key.as_slice() == key {
                return Ok(match entry.value {
                    Some(value) => SegmentGet::Value(value, entry.seq),
                    None => SegmentGet::Tombstone(entry.seq),
                });
            }
            if entry.key.as_slice() > key {
                break;
            }
        }
        Ok(SegmentGet::NotFound)
    }

    /// Binary-search the index for the single block that may hold `key`.
    ///
    /// The writer never splits one key across blocks, so the last block
    /// whose first key is `<= key` is the only candidate.
    fn find_block_for_key(&self, key: &[u8]) -> Option<BlockHandle> {
        let idx = self
            .index
            .partition_point(|entry| entry.first_key.as_slice() <= key);
        idx.checked_sub(1).map(|i| self.index[i].handle)
    }

    /// Verify and return the payload of the framed block at `handle`.
    pub(crate) fn block_data(&self, handle: &BlockHandle) -> Result<&[u8], SegmentError> {
        framed_block(&self.mmap, handle, "data block")
    }

    /// Index entries, in key order.
    pub(crate) fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Highest sequence number stored in this segment.
    pub fn max_seq(&self) -> u64 {
        self.properties.max_seq
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Arrange for the backing file to be unlinked when the last reader
    /// drops this segment.  Used after compaction retires it.
    pub fn mark_delete_on_drop(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            if let Err(error) = std::fs::remove_file(&self.path) {
                warn!(
                    id = self.id,
                    path = %self.path.display(),
                    %error,
                    "failed to delete retired segment file"
                );
            } else {
                debug!(id = self.id, path = %self.path.display(), "deleted retired segment");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Frame helpers (shared with the writer)
// ------------------------------------------------------------------------------------------------

fn verify_header(header: &[u8]) -> Result<(), SegmentError> {
    if header[0..4] != SEGMENT_MAGIC {
        return Err(SegmentError::Corruption("bad magic bytes".into()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != SEGMENT_VERSION {
        return Err(SegmentError::Corruption(format!(
            "unsupported version {version} (expected {SEGMENT_VERSION})"
        )));
    }
    let expected = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let actual = crc32fast::hash(&header[0..8]);
    if expected != actual {
        return Err(SegmentError::ChecksumMismatch {
            section: "header",
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn encode_segment_header() -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    let crc = crc32fast::hash(&header[0..8]);
    header[8..12].copy_from_slice(&crc.to_le_bytes());
    header
}

/// Validate the `[u32 len][payload][crc32]` frame at `handle` and return
/// the payload slice.
fn framed_block<'a>(
    file: &'a [u8],
    handle: &BlockHandle,
    section: &'static str,
) -> Result<&'a [u8], SegmentError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| SegmentError::Corruption(format!("{section}: handle offset overflow")))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| SegmentError::Corruption(format!("{section}: handle size overflow")))?;
    let end = start
        .checked_add(size)
        .ok_or_else(|| SegmentError::Corruption(format!("{section}: handle range overflow")))?;
    if size < BLOCK_FRAME_OVERHEAD as usize || end > file.len() {
        return Err(SegmentError::Corruption(format!(
            "{section}: handle [{start}, {end}) outside file of {} bytes",
            file.len()
        )));
    }

    let frame = &file[start..end];
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if len != size - BLOCK_FRAME_OVERHEAD as usize {
        return Err(SegmentError::Corruption(format!(
            "{section}: frame length {len} disagrees with handle size {size}"
        )));
    }

    let payload = &frame[4..4 + len];
    let expected = u32::from_le_bytes([
        frame[4 + len],
        frame[5 + len],
        frame[6 + len],
        frame[7 + len],
    ]);
    let actual = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&frame[..4]);
        hasher.update(payload);
        hasher.finalize()
    };
    if expected != actual {
        return Err(SegmentError::ChecksumMismatch {
            section,
            expected,
            actual,
        });
    }
    Ok(payload)
}
