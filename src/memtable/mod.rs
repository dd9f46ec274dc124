//! In-memory write buffer backed by a write-ahead log.
//!
//! The [`Memtable`] absorbs every `put`/`delete` in a `BTreeMap` of
//! per-key version lists.  Mutations are WAL-first: the record is
//! appended and synced before the map changes, so an acknowledged write
//! survives a crash.
//!
//! When the buffered size passes `write_buffer_size` a mutation still
//! succeeds but reports [`WriteOutcome::FlushRequired`]; the engine
//! responds by freezing the memtable into an immutable
//! [`FrozenMemtable`] and scheduling a flush to a segment file.
//!
//! Version lists are appended in sequence order, so the newest version
//! of a key is always the last element.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::{Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

/// Rough per-entry bookkeeping cost added to key/value bytes when
/// tracking the buffered size.
const ENTRY_OVERHEAD: usize = 32;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The backing WAL failed.
    #[error("memtable wal error: {0}")]
    Wal(#[from] WalError),
}

// ------------------------------------------------------------------------------------------------
// WAL record
// ------------------------------------------------------------------------------------------------

/// One logged mutation.  `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Encode for WalEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for WalEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (seq, mut offset) = u64::decode_from(buf)?;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { seq, key, value }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Results
// ------------------------------------------------------------------------------------------------

/// Outcome of a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write fit within the buffer.
    Applied,
    /// The write applied, and the memtable is now over `write_buffer_size`.
    FlushRequired,
}

/// Result of a point lookup.
///
/// `Tombstone` is a definitive answer: the key was deleted here, and no
/// older layer may resurrect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGet {
    Value(Vec<u8>),
    Tombstone,
    NotFound,
}

/// One version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub seq: u64,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// Mutable write buffer.  One exists per store at a time; freezing it
/// produces a [`FrozenMemtable`] and the engine swaps in a fresh one
/// with the next WAL generation.
pub struct Memtable {
    tree: BTreeMap<Vec<u8>, Vec<Version>>,
    wal: Wal<WalEntry>,
    approximate_size: usize,
    write_buffer_size: usize,
    max_seq: u64,
}

impl Memtable {
    /// Create an empty memtable with a fresh WAL at `wal_path`.
    pub fn create(
        wal_path: impl AsRef<Path>,
        generation: u64,
        write_buffer_size: usize,
    ) -> Result<Self, MemtableError> {
        let wal = Wal::create(wal_path, generation)?;
        Ok(Self {
            tree: BTreeMap::new(),
            wal,
            approximate_size: 0,
            write_buffer_size,
            max_seq: 0,
        })
    }

    /// Rebuild a memtable from an existing WAL.
    ///
    /// A torn tail (crash mid-append) is repaired in place: replay stops
    /// at the last intact record and the file is truncated there.  Any
    /// other replay failure is surfaced.
    pub fn recover(
        wal_path: impl AsRef<Path>,
        write_buffer_size: usize,
    ) -> Result<Self, MemtableError> {
        let mut wal: Wal<WalEntry> = Wal::open(&wal_path)?;

        let mut tree: BTreeMap<Vec<u8>, Vec<Version>> = BTreeMap::new();
        let mut approximate_size = 0;
        let mut max_seq = 0;
        let mut recovered = 0u64;

        let mut iter = wal.replay_iter()?;
        let mut repair_at = None;
        for result in iter.by_ref() {
            match result {
                Ok(entry) => {
                    approximate_size += entry_weight(&entry.key, entry.value.as_deref());
                    max_seq = max_seq.max(entry.seq);
                    tree.entry(entry.key).or_default().push(Version {
                        seq: entry.seq,
                        value: entry.value,
                    });
                    recovered += 1;
                }
                Err(error) if error.is_torn_tail() => {
                    repair_at = Some(iter.valid_offset());
                    warn!(
                        wal = %wal.path().display(),
                        %error,
                        valid_offset = iter.valid_offset(),
                        "torn wal tail, truncating"
                    );
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }
        if let Some(offset) = repair_at {
            wal.truncate_to(offset)?;
        }

        // Replay preserves append order per key, so each version list
        // stays sorted by ascending seq.
        info!(
            wal = %wal.path().display(),
            generation = wal.generation(),
            recovered,
            max_seq,
            "recovered memtable"
        );
        Ok(Self {
            tree,
            wal,
            approximate_size,
            write_buffer_size,
            max_seq,
        })
    }

    /// Insert a key-value pair at `seq`.  WAL-first.
    pub fn put(&mut self, key: &[u8], value: &[u8], seq: u64) -> Result<WriteOutcome, MemtableError> {
        self.apply(key, Some(value), seq)
    }

    /// Insert a tombstone for `key` at `seq`.  WAL-first.
    pub fn delete(&mut self, key: &[u8], seq: u64) -> Result<WriteOutcome, MemtableError> {
        self.apply(key, None, seq)
    }

    fn apply(
        &mut self,
        key: &[u8],
        value: Option<&[u8]>,
        seq: u64,
    ) -> Result<WriteOutcome, MemtableError> {
        self.wal.append(&WalEntry {
            seq,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        })?;

        self.approximate_size += entry_weight(key, value);
        self.max_seq = self.max_seq.max(seq);
        self.tree.entry(key.to_vec()).or_default().push(Version {
            seq,
            value: value.map(<[u8]>::to_vec),
        });

        if self.approximate_size >= self.write_buffer_size {
            Ok(WriteOutcome::FlushRequired)
        } else {
            Ok(WriteOutcome::Applied)
        }
    }

    /// Look up the newest version of `key`.
    pub fn get(&self, key: &[u8]) -> MemtableGet {
        match self.tree.get(key).and_then(|versions| versions.last()) {
            Some(Version {
                value: Some(value), ..
            }) => MemtableGet::Value(value.clone()),
            Some(Version { value: None, .. }) => MemtableGet::Tombstone,
            None => MemtableGet::NotFound,
        }
    }

    /// Convert into an immutable [`FrozenMemtable`], syncing and closing
    /// the WAL.  The WAL file stays on disk until the flush that drains
    /// this memtable commits.
    pub fn freeze(self) -> Result<FrozenMemtable, MemtableError> {
        self.wal.sync()?;
        let generation = self.wal.generation();
        let wal_path = self.wal.path().to_path_buf();
        Ok(FrozenMemtable {
            tree: self.tree,
            generation,
            wal_path,
            max_seq: self.max_seq,
        })
    }

    /// The newest version of each key in `[start, end)`, in key order.
    /// `None` bounds are unbounded.
    pub fn iter_range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (&'a [u8], &'a Version)> {
        range_newest(&self.tree, start, end)
    }

    /// Number of distinct keys buffered.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// `true` when no mutation has been applied.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Bytes buffered, approximately.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Highest sequence number applied, or 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// WAL generation backing this memtable.
    pub fn generation(&self) -> u64 {
        self.wal.generation()
    }
}

// ------------------------------------------------------------------------------------------------
// FrozenMemtable
// ------------------------------------------------------------------------------------------------

/// An immutable memtable awaiting flush.  Serves reads and feeds the
/// segment writer; its WAL file is removed once the flush commits.
pub struct FrozenMemtable {
    tree: BTreeMap<Vec<u8>, Vec<Version>>,
    generation: u64,
    wal_path: PathBuf,
    max_seq: u64,
}

impl FrozenMemtable {
    /// Look up the newest version of `key`.
    pub fn get(&self, key: &[u8]) -> MemtableGet {
        match self.tree.get(key).and_then(|versions| versions.last()) {
            Some(Version {
                value: Some(value), ..
            }) => MemtableGet::Value(value.clone()),
            Some(Version { value: None, .. }) => MemtableGet::Tombstone,
            None => MemtableGet::NotFound,
        }
    }

    /// The newest version of each key, in ascending key order.
    ///
    /// This is the exact stream a flush writes: older versions of a key
    /// are superseded within one memtable and never reach disk.
    pub fn iter_newest(&self) -> impl Iterator<Item = (&[u8], &Version)> {
        self.tree.iter().filter_map(|(key, versions)| {
            versions.last().map(|version| (key.as_slice(), version))
        })
    }

    /// The newest version of each key in `[start, end)`, in key order.
    pub fn iter_range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (&'a [u8], &'a Version)> {
        range_newest(&self.tree, start, end)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// `true` when the memtable froze empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Highest sequence number contained.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    /// WAL generation this memtable was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Path of the retired WAL file.
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }
}

fn entry_weight(key: &[u8], value: Option<&[u8]>) -> usize {
    key.len() + value.map_or(0, <[u8]>::len) + ENTRY_OVERHEAD
}

fn range_newest<'a>(
    tree: &'a BTreeMap<Vec<u8>, Vec<Version>>,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> impl Iterator<Item = (&'a [u8], &'a Version)> {
    use std::ops::Bound;
    let lo = match start {
        Some(start) => Bound::Included(start.to_vec()),
        None => Bound::Unbounded,
    };
    let hi = match end {
        Some(end) => Bound::Excluded(end.to_vec()),
        None => Bound::Unbounded,
    };
    tree.range((lo, hi)).filter_map(|(key, versions)| {
        versions.last().map(|version| (key.as_slice(), version))
    })
}
