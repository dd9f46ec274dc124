//! Core record type and merge machinery.
//!
//! [`Entry`] is the unit that flows between layers: memtable flushes
//! emit entries, segment blocks store them, and compaction merges them.
//! Sorted streams are always ordered `(key ASC, seq DESC)` so that the
//! newest version of a key is encountered first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::segment::SegmentError;

// ------------------------------------------------------------------------------------------------
// Entry
// ------------------------------------------------------------------------------------------------

/// One version of one key.
///
/// `value: None` is a tombstone.  `seq` is assigned by the engine,
/// strictly monotonic per store; for the same key the entry with the
/// highest `seq` wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seq: u64,
}

impl Entry {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, seq: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            seq,
        }
    }

    pub fn tombstone(key: impl Into<Vec<u8>>, seq: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            seq,
        }
    }

    /// `true` when this entry deletes its key.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Sort order for merged streams: key ascending, then seq descending so
/// the newest version of a key comes first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Encode for Entry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Entry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (seq, mut offset) = u64::decode_from(buf)?;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { key, value, seq }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// MergeIterator
// ------------------------------------------------------------------------------------------------

/// A fallible stream of entries, already sorted `(key ASC, seq DESC)`.
pub type EntryStream<'a> = Box<dyn Iterator<Item = Result<Entry, SegmentError>> + 'a>;

struct HeapItem {
    entry: Entry,
    source: usize,
}

// BinaryHeap is a max-heap; reverse the entry ordering to pop the
// smallest `(key ASC, seq DESC)` item first.  Ties across sources are
// broken by source index, so newer layers (lower index) win.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .cmp(&self.entry)
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

/// K-way merge over sorted entry streams.
///
/// Yields a single stream sorted `(key ASC, seq DESC)`.  The first
/// error from any source ends iteration.
pub struct MergeIterator<'a> {
    sources: Vec<EntryStream<'a>>,
    heap: BinaryHeap<HeapItem>,
    failed: Option<SegmentError>,
    fused: bool,
}

impl<'a> MergeIterator<'a> {
    pub fn new(mut sources: Vec<EntryStream<'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut failed = None;
        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok(entry)) => heap.push(HeapItem { entry, source }),
                Some(Err(error)) => {
                    failed = Some(error);
                    break;
                }
                None => {}
            }
        }
        Self {
            sources,
            heap,
            failed,
            fused: false,
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Entry, SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        if let Some(error) = self.failed.take() {
            self.fused = true;
            return Some(Err(error));
        }

        let HeapItem { entry, source } = self.heap.pop()?;
        match self.sources[source].next() {
            Some(Ok(next)) => self.heap.push(HeapItem {
                entry: next,
                source,
            }),
            Some(Err(error)) => self.failed = Some(error),
            None => {}
        }
        Some(Ok(entry))
    }
}

// ------------------------------------------------------------------------------------------------
// VisibilityFilter
// ------------------------------------------------------------------------------------------------

/// Filters a merged `(key ASC, seq DESC)` stream down to the live
/// key-value pairs: only the newest version of each key is considered,
/// and tombstoned keys are suppressed.
pub struct VisibilityFilter<I>
where
    I: Iterator<Item = Result<Entry, SegmentError>>,
{
    input: I,
    current_key: Option<Vec<u8>>,
}

impl<I> VisibilityFilter<I>
where
    I: Iterator<Item = Result<Entry, SegmentError>>,
{
    pub fn new(input: I) -> Self {
        Self {
            input,
            current_key: None,
        }
    }
}

impl<I> Iterator for VisibilityFilter<I>
where
    I: Iterator<Item = Result<Entry, SegmentError>>,
{
    type Item = Result<(Vec<u8>, Vec<u8>), SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        for result in self.input.by_ref() {
            let entry = match result {
                Ok(entry) => entry,
                Err(error) => return Some(Err(error)),
            };

            // Older versions of an already-decided key.
            if self.current_key.as_deref() == Some(&entry.key) {
                continue;
            }
            self.current_key = Some(entry.key.clone());

            if let Some(value) = entry.value {
                return Some(Ok((entry.key, value)));
            }
            // Tombstone: the key is dead, skip its older versions too.
        }
        None
    }
}
