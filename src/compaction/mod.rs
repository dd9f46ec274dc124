//! Leveled compaction.
//!
//! Segments descend through levels: flushes land in L0, where key
//! ranges may overlap; compaction merges runs downward so that within
//! L1 and deeper every level is a sorted, non-overlapping run of
//! segments.
//!
//! # Policy
//!
//! - **L0 trigger**: when L0 holds `l0_compaction_threshold` or more
//!   segments, all of them merge with the overlapping part of L1 into
//!   new L1 segments.
//! - **Size trigger**: when a deeper level exceeds its byte target
//!   (`level_base_size * multiplier^(level-1)`), one of its segments
//!   merges with the overlapping part of the next level.
//!
//! # Merge semantics
//!
//! Inputs are merged `(key ASC, seq DESC)`; only the newest version of
//! each key survives.  Tombstones are dropped only when the job's
//! `drop_tombstones` flag is set, which the engine grants only when no
//! deeper level holds any segment overlapping the job's key range —
//! otherwise a tombstone must keep shadowing older versions below.
//!
//! Outputs are cut at `segment_target_size`, always on a key boundary,
//! so sibling outputs never overlap.
//!
//! # Atomicity
//!
//! [`run`] only writes new files (each published by temp-file rename);
//! the engine then installs the swap with one manifest record and
//! retires the input files afterward through the segment cache.

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, info};

use crate::engine::entry::{Entry, EntryStream, MergeIterator};
use crate::manifest::SegmentRecord;
use crate::segment::iterator::SegmentIter;
use crate::segment::{SegmentCache, SegmentError, SegmentWriter, segment_file_name};

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced while executing a compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Reading an input or writing an output segment failed.
    #[error("compaction segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Underlying file I/O failed.
    #[error("compaction i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Job description
// ------------------------------------------------------------------------------------------------

/// One unit of compaction work, fully described up front.
#[derive(Debug, Clone)]
pub struct CompactionJob {
    /// Level the trigger fired on.
    pub source_level: u32,
    /// Level the outputs are written to.
    pub target_level: u32,
    /// Input segments from the source level.
    pub source_inputs: Vec<Arc<SegmentRecord>>,
    /// Overlapping input segments already in the target level.
    pub target_inputs: Vec<Arc<SegmentRecord>>,
    /// Whether tombstones (and the versions they shadow) may be
    /// discarded outright.
    pub drop_tombstones: bool,
}

impl CompactionJob {
    /// All inputs, source level first.
    pub fn inputs(&self) -> impl Iterator<Item = &Arc<SegmentRecord>> {
        self.source_inputs.iter().chain(self.target_inputs.iter())
    }

    /// Smallest and largest key touched by any input.
    pub fn key_range(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut range: Option<(Vec<u8>, Vec<u8>)> = None;
        for input in self.inputs() {
            range = Some(match range {
                None => (input.min_key.clone(), input.max_key.clone()),
                Some((lo, hi)) => (
                    lo.min(input.min_key.clone()),
                    hi.max(input.max_key.clone()),
                ),
            });
        }
        range
    }
}

/// Result of a finished merge, ready for one manifest record.
#[derive(Debug, Clone, Default)]
pub struct CompactionOutcome {
    pub added: Vec<SegmentRecord>,
    pub removed: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// Job selection
// ------------------------------------------------------------------------------------------------

/// Sizing knobs the pickers work from.
#[derive(Debug, Clone, Copy)]
pub struct LevelPolicy {
    pub l0_compaction_threshold: usize,
    pub level_base_size: u64,
    pub level_size_multiplier: u64,
    pub max_levels: usize,
}

impl LevelPolicy {
    /// Byte budget for `level` (levels 1 and deeper).
    pub fn target_size(&self, level: usize) -> u64 {
        let exponent = level.saturating_sub(1) as u32;
        self.level_base_size
            .saturating_mul(self.level_size_multiplier.saturating_pow(exponent))
    }
}

/// Pick the next automatic job, if any trigger fires.
///
/// `levels[0]` must be sorted newest-first, deeper levels by key.
pub fn pick_auto(
    levels: &[Vec<Arc<SegmentRecord>>],
    policy: &LevelPolicy,
) -> Option<CompactionJob> {
    // L0 count trigger takes priority: overlapping L0 runs cost every
    // read a probe each.
    if levels[0].len() >= policy.l0_compaction_threshold {
        let source_inputs = levels[0].clone();
        let (lo, hi) = key_span(&source_inputs)?;
        let target_inputs = overlapping_span(levels.get(1), &lo, &hi);
        return Some(job_for(levels, 0, source_inputs, target_inputs));
    }

    for level in 1..levels.len().saturating_sub(1) {
        let size: u64 = levels[level].iter().map(|s| s.file_size).sum();
        if size <= policy.target_size(level) {
            continue;
        }
        // Largest segment first: it frees the most budget per merge.
        let seed = levels[level]
            .iter()
            .max_by_key(|s| s.file_size)?
            .clone();
        let target_inputs = overlapping_span(levels.get(level + 1), &seed.min_key, &seed.max_key);
        return Some(job_for(levels, level as u32, vec![seed], target_inputs));
    }
    None
}

/// Pick the job that compacts everything in `[start, end)` at `level`
/// into `level + 1`.  Returns `None` when the level has nothing in
/// range.
pub fn pick_range(
    levels: &[Vec<Arc<SegmentRecord>>],
    level: usize,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Option<CompactionJob> {
    let source_inputs = overlapping(levels.get(level), start, end);
    if source_inputs.is_empty() {
        return None;
    }
    let (lo, hi) = key_span(&source_inputs)?;
    let target_inputs = overlapping_span(levels.get(level + 1), &lo, &hi);
    Some(job_for(levels, level as u32, source_inputs, target_inputs))
}

fn job_for(
    levels: &[Vec<Arc<SegmentRecord>>],
    source_level: u32,
    source_inputs: Vec<Arc<SegmentRecord>>,
    target_inputs: Vec<Arc<SegmentRecord>>,
) -> CompactionJob {
    let mut job = CompactionJob {
        source_level,
        target_level: source_level + 1,
        source_inputs,
        target_inputs,
        drop_tombstones: false,
    };
    // Tombstones may die only when nothing below the target level can
    // still hold a shadowed version of a key in this job's range.
    if let Some((lo, hi)) = job.key_range() {
        let deeper_overlap = levels
            .iter()
            .skip(job.target_level as usize + 1)
            .flatten()
            .any(|s| s.min_key <= hi && lo <= s.max_key);
        job.drop_tombstones = !deeper_overlap;
    }
    job
}

/// Segments of `level` whose key range intersects `[start, end)`
/// (bounds optional), in level order.
fn overlapping(
    level: Option<&Vec<Arc<SegmentRecord>>>,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Vec<Arc<SegmentRecord>> {
    level
        .map(|segments| {
            segments
                .iter()
                .filter(|s| s.overlaps_range(start, end))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Segments of `level` whose key range intersects the inclusive span
/// `[lo, hi]`, in level order.  Span bounds come from segment max keys,
/// so the upper bound must be inclusive here.
fn overlapping_span(
    level: Option<&Vec<Arc<SegmentRecord>>>,
    lo: &[u8],
    hi: &[u8],
) -> Vec<Arc<SegmentRecord>> {
    level
        .map(|segments| {
            segments
                .iter()
                .filter(|s| s.min_key.as_slice() <= hi && lo <= s.max_key.as_slice())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn key_span(inputs: &[Arc<SegmentRecord>]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut span: Option<(Vec<u8>, Vec<u8>)> = None;
    for input in inputs {
        span = Some(match span {
            None => (input.min_key.clone(), input.max_key.clone()),
            Some((lo, hi)) => (
                lo.min(input.min_key.clone()),
                hi.max(input.max_key.clone()),
            ),
        });
    }
    span
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Merge the job's inputs into new target-level segments.
///
/// Pure file work: reads inputs through the cache, writes outputs under
/// `segment_dir` with ids from `next_id`, and returns the swap for the
/// engine to install.  Nothing is deleted here.
pub fn run(
    job: &CompactionJob,
    cache: &SegmentCache,
    segment_dir: &Path,
    segment_target_size: u64,
    next_id: &AtomicU64,
) -> Result<CompactionOutcome, CompactionError> {
    let removed: Vec<u64> = job.inputs().map(|s| s.id).collect();
    info!(
        source_level = job.source_level,
        target_level = job.target_level,
        inputs = removed.len(),
        drop_tombstones = job.drop_tombstones,
        "compaction: starting merge"
    );

    let mut streams: Vec<EntryStream<'_>> = Vec::new();
    let mut opened = Vec::new();
    for record in job.inputs() {
        let path = segment_dir.join(segment_file_name(record.id));
        let segment = cache.get(record.id, &path)?;
        opened.push(segment);
    }
    for segment in &opened {
        streams.push(Box::new(SegmentIter::full(Arc::clone(segment))));
    }
    let merged = MergeIterator::new(streams);

    let mut outputs = OutputSink::new(segment_dir, job.target_level, segment_target_size, next_id);
    let mut last_key: Option<Vec<u8>> = None;
    for result in merged {
        let entry = result?;
        // Only the newest version of each key survives the merge.
        if last_key.as_deref() == Some(entry.key.as_slice()) {
            continue;
        }
        last_key = Some(entry.key.clone());

        if entry.is_tombstone() && job.drop_tombstones {
            continue;
        }
        outputs.push(&entry)?;
    }
    let added = outputs.finish()?;

    info!(
        outputs = added.len(),
        removed = removed.len(),
        "compaction: merge complete"
    );
    Ok(CompactionOutcome { added, removed })
}

/// Rolls merged entries into size-bounded output segments.
struct OutputSink<'a> {
    segment_dir: &'a Path,
    level: u32,
    target_size: u64,
    next_id: &'a AtomicU64,
    writer: Option<(u64, SegmentWriter)>,
    records: Vec<SegmentRecord>,
}

impl<'a> OutputSink<'a> {
    fn new(
        segment_dir: &'a Path,
        level: u32,
        target_size: u64,
        next_id: &'a AtomicU64,
    ) -> Self {
        Self {
            segment_dir,
            level,
            target_size,
            next_id,
            writer: None,
            records: Vec::new(),
        }
    }

    fn push(&mut self, entry: &Entry) -> Result<(), CompactionError> {
        if let Some((_, writer)) = &self.writer
            && writer.approximate_size() >= self.target_size
        {
            self.roll()?;
        }
        if self.writer.is_none() {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let path = self.segment_dir.join(segment_file_name(id));
            self.writer = Some((id, SegmentWriter::create(&path)?));
            debug!(id, level = self.level, "compaction: opened output segment");
        }
        if let Some((_, writer)) = &mut self.writer {
            writer.add(entry)?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<(), CompactionError> {
        if let Some((id, writer)) = self.writer.take() {
            let stats = writer.finish()?;
            self.records.push(SegmentRecord {
                id,
                level: self.level,
                min_key: stats.min_key,
                max_key: stats.max_key,
                max_seq: stats.max_seq,
                file_size: stats.file_size,
                entry_count: stats.entry_count,
            });
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<SegmentRecord>, CompactionError> {
        self.roll()?;
        Ok(self.records)
    }
}
