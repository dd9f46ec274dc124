//! Block and segment iteration.
//!
//! [`BlockIterator`] walks the entries of one decoded data block.
//! [`SegmentIter`] streams a whole segment (or a key range of it) in
//! `(key ASC, seq DESC)` order, loading and verifying blocks lazily so
//! a bounded scan never touches blocks outside its range.

use std::sync::Arc;

use crate::encoding::Decode;
use crate::engine::entry::Entry;

use super::{Segment, SegmentError};

// ------------------------------------------------------------------------------------------------
// BlockIterator
// ------------------------------------------------------------------------------------------------

/// Sequential reader over the entries of one data block payload.
///
/// The payload has already passed its frame checksum; a decode failure
/// here still means corruption and ends iteration with an error.
pub struct BlockIterator<'a> {
    data: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> BlockIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            cursor: 0,
            failed: false,
        }
    }
}

impl Iterator for BlockIterator<'_> {
    type Item = Result<Entry, SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.data.len() {
            return None;
        }
        match Entry::decode_from(&self.data[self.cursor..]) {
            Ok((entry, consumed)) => {
                self.cursor += consumed;
                Some(Ok(entry))
            }
            Err(error) => {
                self.failed = true;
                Some(Err(error.into()))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentIter
// ------------------------------------------------------------------------------------------------

/// Lazy range scan over one segment.
///
/// `start` is inclusive and `end` exclusive; `None` means unbounded.
/// Holds an `Arc<Segment>` so the backing file outlives the scan even
/// if compaction retires the segment meanwhile.
pub struct SegmentIter {
    segment: Arc<Segment>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    next_block: usize,
    current: std::vec::IntoIter<Entry>,
    done: bool,
}

impl SegmentIter {
    pub fn new(segment: Arc<Segment>, start: Option<&[u8]>, end: Option<&[u8]>) -> Self {
        // Skip blocks that end before `start`: the candidate block is the
        // last one whose first key is <= start, every earlier one is out.
        let next_block = match start {
            Some(start) => segment
                .index()
                .partition_point(|e| e.first_key.as_slice() <= start)
                .saturating_sub(1),
            None => 0,
        };
        Self {
            segment,
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            next_block,
            current: Vec::new().into_iter(),
            done: false,
        }
    }

    /// Full-segment scan.
    pub fn full(segment: Arc<Segment>) -> Self {
        Self::new(segment, None, None)
    }

    fn load_next_block(&mut self) -> Result<bool, SegmentError> {
        let index = self.segment.index();
        if self.next_block >= index.len() {
            return Ok(false);
        }
        if let Some(end) = &self.end
            && index[self.next_block].first_key.as_slice() >= end.as_slice()
        {
            return Ok(false);
        }

        let handle = index[self.next_block].handle;
        self.next_block += 1;

        let data = self.segment.block_data(&handle)?;
        let mut entries = Vec::new();
        let mut block = BlockIterator::new(data);
        while let Some(entry) = block.next().transpose()? {
            entries.push(entry);
        }
        self.current = entries.into_iter();
        Ok(true)
    }
}

impl Iterator for SegmentIter {
    type Item = Result<Entry, SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(entry) = self.current.next() else {
                match self.load_next_block() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(error) => {
                        self.done = true;
                        return Some(Err(error));
                    }
                }
            };

            if let Some(start) = &self.start
                && entry.key.as_slice() < start.as_slice()
            {
                continue;
            }
            if let Some(end) = &self.end
                && entry.key.as_slice() >= end.as_slice()
            {
                self.done = true;
                return None;
            }
            return Some(Ok(entry));
        }
    }
}
