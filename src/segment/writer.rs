//! Streaming segment builder.
//!
//! [`SegmentWriter`] writes one segment file entry by entry:
//!
//! 1. `create` opens a temp file next to the target path and writes the
//!    header.
//! 2. `add` appends entries in strict `(key ASC, seq DESC)` order,
//!    cutting a checksummed ~4 KiB data block whenever the current one
//!    is full.  Out-of-order input is rejected, not reordered.
//! 3. `finish` writes the bloom, properties, and index blocks plus the
//!    footer, syncs, and atomically renames the temp file into place.
//!
//! A crash before the rename leaves only a temp file, which recovery
//! sweeps away; the target path either does not exist or holds a
//! complete, verified segment.

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use tracing::{debug, warn};

use crate::encoding::{self, Encode};
use crate::engine::entry::Entry;

use super::{
    BLOCK_TARGET_SIZE, BLOOM_FP_RATE, BlockHandle, Footer, IndexEntry, Properties, SEGMENT_HEADER_SIZE,
    SegmentError, encode_segment_header,
};

/// Summary of a finished segment, fed into its manifest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub entry_count: u64,
    pub tombstone_count: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub file_size: u64,
}

/// Stateful builder for one segment file.
pub struct SegmentWriter {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    offset: u64,

    block: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    index: Vec<IndexEntry>,

    // Keys are collected so the bloom filter can be sized exactly at
    // finish time.
    keys: Vec<Vec<u8>>,

    last: Option<(Vec<u8>, u64)>,
    finished: bool,

    entry_count: u64,
    tombstone_count: u64,
    min_seq: u64,
    max_seq: u64,
    min_key: Option<Vec<u8>>,
    max_key: Vec<u8>,
}

impl SegmentWriter {
    /// Open a temp file for the segment that will live at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        file.write_all(&encode_segment_header())?;

        Ok(Self {
            file,
            tmp_path,
            final_path,
            offset: SEGMENT_HEADER_SIZE,
            block: Vec::with_capacity(BLOCK_TARGET_SIZE),
            block_first_key: None,
            index: Vec::new(),
            keys: Vec::new(),
            last: None,
            finished: false,
            entry_count: 0,
            tombstone_count: 0,
            min_seq: u64::MAX,
            max_seq: 0,
            min_key: None,
            max_key: Vec::new(),
        })
    }

    /// Append one entry.
    ///
    /// Input must be strictly ascending in `(key ASC, seq DESC)`; a
    /// violation returns [`SegmentError::OutOfOrder`] and the caller's
    /// misuse surfaces as an invalid-argument error.
    pub fn add(&mut self, entry: &Entry) -> Result<(), SegmentError> {
        if let Some((last_key, last_seq)) = &self.last {
            let ordered = match entry.key.cmp(last_key) {
                Ordering::Greater => true,
                Ordering::Equal => entry.seq < *last_seq,
                Ordering::Less => false,
            };
            if !ordered {
                return Err(SegmentError::OutOfOrder(format!(
                    "entry (key {:02x?}, seq {}) does not follow (key {:02x?}, seq {})",
                    entry.key, entry.seq, last_key, last_seq
                )));
            }
        }

        // Cut the block only between distinct keys so that every version
        // of a key lands in one block; point lookups then visit exactly
        // one block.
        let key_changed = self
            .last
            .as_ref()
            .is_none_or(|(last_key, _)| *last_key != entry.key);
        if key_changed && self.block.len() >= BLOCK_TARGET_SIZE {
            self.cut_block()?;
        }

        if self.block_first_key.is_none() {
            self.block_first_key = Some(entry.key.clone());
        }
        entry.encode_to(&mut self.block)?;

        if key_changed {
            self.keys.push(entry.key.clone());
        }
        self.entry_count += 1;
        if entry.is_tombstone() {
            self.tombstone_count += 1;
        }
        self.min_seq = self.min_seq.min(entry.seq);
        self.max_seq = self.max_seq.max(entry.seq);
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = entry.key.clone();
        self.last = Some((entry.key.clone(), entry.seq));
        Ok(())
    }

    /// Write the meta blocks and footer, sync, and publish the file.
    ///
    /// Consumes the writer; returns the stats a manifest record needs.
    pub fn finish(mut self) -> Result<SegmentStats, SegmentError> {
        let Some(min_key) = self.min_key.take() else {
            return Err(SegmentError::Empty);
        };
        if !self.block.is_empty() {
            self.cut_block()?;
        }

        let mut bloom = Bloom::new_for_fp_rate(self.keys.len(), BLOOM_FP_RATE)
            .map_err(|e| SegmentError::Bloom(e.to_string()))?;
        for key in &self.keys {
            bloom.set(key.as_slice());
        }
        let bloom_handle = self.write_framed(bloom.as_slice())?;

        let properties = Properties {
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            min_key: min_key.clone(),
            max_key: self.max_key.clone(),
        };
        let props_bytes = encoding::encode_to_vec(&properties)?;
        let props_handle = self.write_framed(&props_bytes)?;

        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        let index_handle = self.write_framed(&index_bytes)?;

        let file_size = self.offset + super::SEGMENT_FOOTER_SIZE;
        let footer = Footer {
            bloom: bloom_handle,
            properties: props_handle,
            index: index_handle,
            file_size,
        };
        self.file.write_all(&footer.to_bytes())?;
        self.file.sync_all()?;

        std::fs::rename(&self.tmp_path, &self.final_path)?;
        sync_parent_dir(&self.final_path)?;
        self.finished = true;

        debug!(
            path = %self.final_path.display(),
            entries = self.entry_count,
            tombstones = self.tombstone_count,
            blocks = self.index.len(),
            file_size,
            "finished segment"
        );
        Ok(SegmentStats {
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            min_seq: self.min_seq,
            max_seq: self.max_seq,
            min_key,
            max_key: self.max_key.clone(),
            file_size,
        })
    }

    /// Entries added so far.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes written plus the current unflushed block.
    pub fn approximate_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    /// Frame the current data block, record its index entry, and reset.
    fn cut_block(&mut self) -> Result<(), SegmentError> {
        let Some(first_key) = self.block_first_key.take() else {
            return Ok(());
        };
        let payload = std::mem::take(&mut self.block);
        let handle = self.write_framed(&payload)?;
        self.index.push(IndexEntry { first_key, handle });
        self.block = Vec::with_capacity(BLOCK_TARGET_SIZE);
        Ok(())
    }

    /// Write `[u32 len][payload][crc32]` at the current offset.
    fn write_framed(&mut self, payload: &[u8]) -> Result<BlockHandle, SegmentError> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            SegmentError::Corruption(format!("block of {} bytes exceeds u32", payload.len()))
        })?;
        let len_bytes = len.to_le_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_bytes);
        hasher.update(payload);
        let crc = hasher.finalize();

        self.file.write_all(&len_bytes)?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;

        let handle = BlockHandle {
            offset: self.offset,
            size: payload.len() as u64 + super::BLOCK_FRAME_OVERHEAD,
        };
        self.offset += handle.size;
        Ok(handle)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if !self.finished
            && let Err(error) = std::fs::remove_file(&self.tmp_path)
        {
            warn!(
                path = %self.tmp_path.display(),
                %error,
                "failed to remove abandoned segment temp file"
            );
        }
    }
}

/// Fsync the directory containing `path` so the rename is durable.
fn sync_parent_dir(path: &Path) -> Result<(), SegmentError> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
