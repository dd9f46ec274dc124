//! Storage engine orchestration.
//!
//! The engine wires the layers together: the active memtable and its
//! WAL, frozen memtables awaiting flush, the leveled segment tree, and
//! the manifest that catalogs all of it.
//!
//! # Locking
//!
//! Shared state lives in an `Arc<RwLock<EngineInner>>`.  Writers take
//! the write lock briefly per mutation; readers answer from memtables
//! and resolve segment handles under the read lock, then do their disk
//! probing outside it.  Holding a handle pins the segment file, so a
//! compaction that retires it between resolution and probe cannot pull
//! the data out from under the reader.
//! Flush and compaction serialize against each other on a dedicated
//! maintenance mutex, and their heavy I/O (building and merging
//! segment files) runs without the engine lock — only the manifest
//! record and level swap at the end take the write lock.
//!
//! # Read path
//!
//! `get` consults, in order: the active memtable, frozen memtables
//! newest first, L0 segments newest first, then exactly one candidate
//! segment per deeper level found by key-range binary search.  The
//! first version found wins; a tombstone answers `None`.
//!
//! # Recovery
//!
//! `open` loads the manifest, rebuilds the active and frozen memtables
//! from their WALs (repairing torn tails), sweeps orphan segment and
//! WAL files that a crash left unreferenced, and restores the sequence
//! counter from the maximum across manifest, WALs, and segments.

pub mod entry;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compaction::{self, CompactionError, CompactionJob, CompactionOutcome, LevelPolicy};
use crate::manifest::{Manifest, ManifestError, SegmentRecord};
use crate::memtable::{FrozenMemtable, Memtable, MemtableError, MemtableGet, WriteOutcome};
use crate::segment::iterator::SegmentIter;
use crate::segment::{
    Segment, SegmentCache, SegmentError, SegmentGet, SegmentWriter, segment_file_name,
};
use crate::wal::{WalError, wal_file_name};
use entry::{Entry, EntryStream, MergeIterator, VisibilityFilter};

// ------------------------------------------------------------------------------------------------
// Directory layout
// ------------------------------------------------------------------------------------------------

/// Subdirectory holding memtable WALs.
pub const WAL_DIR: &str = "wal";

/// Subdirectory holding segment files.
pub const SEGMENT_DIR: &str = "segments";

/// Subdirectory holding the manifest.
pub const MANIFEST_DIR: &str = "manifest";

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A write-ahead log failed.
    #[error(transparent)]
    Wal(#[from] WalError),

    /// The memtable failed.
    #[error(transparent)]
    Memtable(#[from] MemtableError),

    /// A segment failed.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// The manifest failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A compaction failed.
    #[error(transparent)]
    Compaction(#[from] CompactionError),

    /// Caller misuse: bad key, bad configuration, missing store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store already exists and `error_if_exists` was set.
    #[error("store already exists: {0}")]
    AlreadyExists(String),

    /// A lock was poisoned by a panic in another thread.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Fully resolved engine configuration, produced from the public
/// `Options` by the store facade.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub write_buffer_size: usize,
    pub max_open_files: usize,
    pub l0_compaction_threshold: usize,
    pub level_base_size: u64,
    pub level_size_multiplier: u64,
    pub segment_target_size: u64,
    pub max_levels: usize,
}

impl EngineConfig {
    fn policy(&self) -> LevelPolicy {
        LevelPolicy {
            l0_compaction_threshold: self.l0_compaction_threshold,
            level_base_size: self.level_base_size,
            level_size_multiplier: self.level_size_multiplier,
            max_levels: self.max_levels,
        }
    }
}

/// Point-in-time engine counters and layer sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub active_memtable_bytes: usize,
    pub frozen_memtables: usize,
    pub segments_per_level: Vec<usize>,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    deletes: AtomicU64,
    gets: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    manifest: Manifest,
    active: Memtable,
    /// Frozen memtables, oldest first; flushed front to back.
    frozen: Vec<Arc<FrozenMemtable>>,
    /// `levels[0]` sorted newest-first by max seq; deeper levels sorted
    /// by min key and non-overlapping.
    levels: Vec<Vec<Arc<SegmentRecord>>>,
    next_seq: u64,
}

/// The storage engine.  Cheap to share: clones of the `Arc`s inside are
/// handed to background workers by the store facade.
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
    cache: Arc<SegmentCache>,
    config: EngineConfig,
    wal_dir: PathBuf,
    segment_dir: PathBuf,
    /// Serializes flushes and compactions; neither holds the engine
    /// write lock during file I/O.
    maintenance: Mutex<()>,
    next_file_id: AtomicU64,
    counters: Counters,
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Open / recovery
    // --------------------------------------------------------------------------------------------

    /// Open or create the store described by `config`.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let data_dir = config.data_dir.clone();
        let wal_dir = data_dir.join(WAL_DIR);
        let segment_dir = data_dir.join(SEGMENT_DIR);
        let manifest_dir = data_dir.join(MANIFEST_DIR);

        let exists = Manifest::exists(&manifest_dir);
        if exists && config.error_if_exists {
            return Err(EngineError::AlreadyExists(data_dir.display().to_string()));
        }
        if !exists && !config.create_if_missing {
            return Err(EngineError::InvalidArgument(format!(
                "store does not exist at {} and create_if_missing is off",
                data_dir.display()
            )));
        }
        for dir in [&data_dir, &wal_dir, &segment_dir, &manifest_dir] {
            fs::create_dir_all(dir)?;
        }

        let mut manifest = if exists {
            Manifest::open(&manifest_dir)?
        } else {
            Manifest::create(&manifest_dir)?
        };

        // Sweep files a crash left unreferenced before anything new is
        // created, so ids can be reused safely.
        sweep_orphans(&segment_dir, &wal_dir, &manifest)?;

        let active_gen = manifest.active_wal();
        let active_path = wal_dir.join(wal_file_name(active_gen));
        let active = if active_path.exists() {
            Memtable::recover(&active_path, config.write_buffer_size)?
        } else {
            Memtable::create(&active_path, active_gen, config.write_buffer_size)?
        };

        let mut frozen = Vec::new();
        for &generation in manifest.frozen_wals().to_vec().iter() {
            let path = wal_dir.join(wal_file_name(generation));
            if !path.exists() {
                warn!(generation, "frozen wal listed in manifest is missing, skipping");
                manifest.remove_frozen_wal(generation)?;
                continue;
            }
            let recovered = Memtable::recover(&path, config.write_buffer_size)?;
            if recovered.is_empty() {
                manifest.remove_frozen_wal(generation)?;
                remove_file_logged(&path);
                continue;
            }
            frozen.push(Arc::new(recovered.freeze()?));
        }

        let levels = build_levels(manifest.segments(), config.max_levels);

        let max_segment_seq = manifest
            .segments()
            .iter()
            .map(|s| s.max_seq)
            .max()
            .unwrap_or(0);
        let max_frozen_seq = frozen.iter().map(|f| f.max_seq()).max().unwrap_or(0);
        let next_seq = manifest
            .last_seq()
            .max(active.max_seq())
            .max(max_frozen_seq)
            .max(max_segment_seq)
            + 1;

        let next_file_id = manifest.next_segment_id();
        let cache = Arc::new(SegmentCache::new(config.max_open_files));

        info!(
            data_dir = %data_dir.display(),
            next_seq,
            frozen = frozen.len(),
            segments = manifest.segments().len(),
            "engine opened"
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(EngineInner {
                manifest,
                active,
                frozen,
                levels,
                next_seq,
            })),
            cache,
            config,
            wal_dir,
            segment_dir,
            maintenance: Mutex::new(()),
            next_file_id: AtomicU64::new(next_file_id),
            counters: Counters::default(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Insert `key → value`.  Returns `true` when the write filled the
    /// memtable and a background flush should be scheduled.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, EngineError> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.write(key, Some(value))
    }

    /// Insert a tombstone for `key`.  Returns `true` when a background
    /// flush should be scheduled.
    pub fn delete(&self, key: &[u8]) -> Result<bool, EngineError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, EngineError> {
        let mut inner = self.write_lock()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let outcome = match value {
            Some(value) => inner.active.put(key, value, seq)?,
            None => inner.active.delete(key, seq)?,
        };

        if outcome == WriteOutcome::FlushRequired {
            self.freeze_active(&mut inner)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Swap in a fresh memtable and WAL; the old one joins the frozen
    /// queue.  Caller holds the write lock.
    fn freeze_active(&self, inner: &mut EngineInner) -> Result<(), EngineError> {
        if inner.active.is_empty() {
            return Ok(());
        }
        let old_gen = inner.active.generation();
        let new_gen = old_gen + 1;
        let new_path = self.wal_dir.join(wal_file_name(new_gen));
        let fresh = Memtable::create(&new_path, new_gen, self.config.write_buffer_size)?;

        let last_seq = inner.next_seq.saturating_sub(1);
        inner.manifest.add_frozen_wal(old_gen)?;
        inner.manifest.set_active_wal(new_gen)?;
        inner.manifest.update_seq(last_seq)?;

        let old = std::mem::replace(&mut inner.active, fresh);
        let frozen = Arc::new(old.freeze()?);
        info!(
            generation = old_gen,
            keys = frozen.len(),
            max_seq = frozen.max_seq(),
            "froze memtable"
        );
        inner.frozen.push(frozen);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Point lookup.  `Ok(None)` for a missing or deleted key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        // Memtable layers are answered under the read lock.  Candidate
        // segments are resolved to open handles before the lock drops:
        // compaction installs its level swap under the write lock and
        // only then unlinks the inputs, so a handle taken here pins the
        // file (mmap stays valid past the unlink) for the probe below.
        let candidates = {
            let inner = self.read_lock()?;
            match inner.active.get(key) {
                MemtableGet::Value(value) => return Ok(Some(value)),
                MemtableGet::Tombstone => return Ok(None),
                MemtableGet::NotFound => {}
            }
            for frozen in inner.frozen.iter().rev() {
                match frozen.get(key) {
                    MemtableGet::Value(value) => return Ok(Some(value)),
                    MemtableGet::Tombstone => return Ok(None),
                    MemtableGet::NotFound => {}
                }
            }

            let mut candidates = Vec::new();
            // L0 segments overlap; probe newest first.
            for record in &inner.levels[0] {
                if record.min_key.as_slice() <= key && key <= record.max_key.as_slice() {
                    candidates.push(self.resolve_segment(record)?);
                }
            }
            // Deeper levels are non-overlapping: binary search finds
            // the single candidate per level.
            for level in inner.levels.iter().skip(1) {
                let idx = level.partition_point(|s| s.max_key.as_slice() < key);
                if idx >= level.len() || level[idx].min_key.as_slice() > key {
                    continue;
                }
                candidates.push(self.resolve_segment(&level[idx])?);
            }
            candidates
        };

        for segment in candidates {
            match segment.get(key)? {
                SegmentGet::Value(value, _) => return Ok(Some(value)),
                SegmentGet::Tombstone(_) => return Ok(None),
                SegmentGet::NotFound => {}
            }
        }
        Ok(None)
    }

    fn resolve_segment(&self, record: &SegmentRecord) -> Result<Arc<Segment>, EngineError> {
        let path = self.segment_dir.join(segment_file_name(record.id));
        Ok(self.cache.get(record.id, &path)?)
    }

    /// Merged range scan over every layer, visibility applied.
    ///
    /// `start` inclusive, `end` exclusive, `None` unbounded.  Returns
    /// live pairs in ascending key order.
    pub fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        // An inverted or empty range matches nothing.
        if let (Some(start), Some(end)) = (start, end)
            && start >= end
        {
            return Ok(Vec::new());
        }

        // Memtable layers are materialized and overlapping segments
        // resolved to open handles under the read lock, pinning files
        // that a concurrent compaction retires; the merge itself reads
        // mmap'd immutable data afterwards.
        let (mem_streams, segments) = {
            let inner = self.read_lock()?;
            let mut streams: Vec<Vec<Entry>> = Vec::new();
            streams.push(collect_mem_range(inner.active.iter_range(start, end)));
            for frozen in inner.frozen.iter().rev() {
                streams.push(collect_mem_range(frozen.iter_range(start, end)));
            }
            let mut segments = Vec::new();
            for level in &inner.levels {
                for record in level {
                    if record.overlaps_range(start, end) {
                        segments.push(self.resolve_segment(record)?);
                    }
                }
            }
            (streams, segments)
        };

        let mut sources: Vec<EntryStream<'_>> = Vec::new();
        for stream in mem_streams {
            sources.push(Box::new(stream.into_iter().map(Ok)));
        }
        for segment in segments {
            sources.push(Box::new(SegmentIter::new(segment, start, end)));
        }

        let merged = MergeIterator::new(sources);
        let mut result = Vec::new();
        for pair in VisibilityFilter::new(merged) {
            result.push(pair?);
        }
        Ok(result)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Blocking flush: freeze the active memtable (if non-empty) and
    /// drain every frozen memtable to L0 segments.
    pub fn flush(&self) -> Result<(), EngineError> {
        let _maintenance = self.maintenance_lock()?;
        {
            let mut inner = self.write_lock()?;
            self.freeze_active(&mut inner)?;
        }
        while self.flush_one()? {}
        Ok(())
    }

    /// Drain frozen memtables without force-freezing the active one.
    /// Background workers call this after a write fills the buffer.
    pub fn flush_pending(&self) -> Result<(), EngineError> {
        let _maintenance = self.maintenance_lock()?;
        while self.flush_one()? {}
        Ok(())
    }

    /// Flush the oldest frozen memtable, if any.  Returns whether one
    /// was flushed.  Caller holds the maintenance lock.
    fn flush_one(&self) -> Result<bool, EngineError> {
        let Some(frozen) = ({
            let inner = self.read_lock()?;
            inner.frozen.first().cloned()
        }) else {
            return Ok(false);
        };

        // Build the segment outside the engine lock; the frozen
        // memtable is immutable.
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.segment_dir.join(segment_file_name(id));
        let mut writer = SegmentWriter::create(&path)?;
        for (key, version) in frozen.iter_newest() {
            writer.add(&Entry {
                key: key.to_vec(),
                value: version.value.clone(),
                seq: version.seq,
            })?;
        }
        let stats = writer.finish()?;

        let record = SegmentRecord {
            id,
            level: 0,
            min_key: stats.min_key,
            max_key: stats.max_key,
            max_seq: stats.max_seq,
            file_size: stats.file_size,
            entry_count: stats.entry_count,
        };

        {
            let mut inner = self.write_lock()?;
            inner
                .manifest
                .record_flush(record.clone(), frozen.generation())?;
            inner.manifest.checkpoint()?;
            inner.frozen.retain(|f| f.generation() != frozen.generation());
            inner.levels = build_levels(inner.manifest.segments(), self.config.max_levels);
        }
        remove_file_logged(frozen.wal_path());

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        info!(
            segment = id,
            keys = record.entry_count,
            generation = frozen.generation(),
            "flushed memtable to level 0"
        );
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Run automatic compactions until no trigger fires.
    pub fn maybe_compact(&self) -> Result<(), EngineError> {
        let _maintenance = self.maintenance_lock()?;
        loop {
            let job = {
                let inner = self.read_lock()?;
                compaction::pick_auto(&inner.levels, &self.config.policy())
            };
            let Some(job) = job else { return Ok(()) };
            self.run_compaction(&job)?;
        }
    }

    /// Blocking range compaction: push every segment overlapping
    /// `[start, end)` down to the deepest populated level.
    ///
    /// Frozen memtable data in the range participates because pending
    /// flushes are drained first.
    pub fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        self.flush()?;
        let _maintenance = self.maintenance_lock()?;

        let bottom = {
            let inner = self.read_lock()?;
            deepest_populated_level(&inner.levels, start, end).max(1)
        };

        for level in 0..bottom {
            let job = {
                let inner = self.read_lock()?;
                compaction::pick_range(&inner.levels, level, start, end)
            };
            if let Some(job) = job {
                self.run_compaction(&job)?;
            }
        }
        Ok(())
    }

    /// Merge the job's inputs off-lock, then install the swap.
    fn run_compaction(&self, job: &CompactionJob) -> Result<(), EngineError> {
        let outcome = compaction::run(
            job,
            &self.cache,
            &self.segment_dir,
            self.config.segment_target_size,
            &self.next_file_id,
        )?;
        self.apply_compaction(outcome)
    }

    fn apply_compaction(&self, outcome: CompactionOutcome) -> Result<(), EngineError> {
        let CompactionOutcome { added, removed } = outcome;
        {
            let mut inner = self.write_lock()?;
            inner.manifest.record_compaction(added, removed.clone())?;
            inner.manifest.checkpoint()?;
            inner.levels = build_levels(inner.manifest.segments(), self.config.max_levels);
        }
        // Input files go away only after in-flight readers finish.
        for id in removed {
            let path = self.segment_dir.join(segment_file_name(id));
            self.cache.delete_segment(id, &path);
        }
        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    /// Snapshot of counters and layer sizes.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.read_lock()?;
        Ok(EngineStats {
            puts: self.counters.puts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
            active_memtable_bytes: inner.active.approximate_size(),
            frozen_memtables: inner.frozen.len(),
            segments_per_level: inner.levels.iter().map(Vec::len).collect(),
        })
    }

    /// The data directory this engine serves.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("engine lock poisoned".into()))
    }

    fn maintenance_lock(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.maintenance
            .lock()
            .map_err(|_| EngineError::Internal("maintenance lock poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Group the manifest's flat segment list into per-level vectors:
/// L0 newest-first by max seq, deeper levels ascending by min key.
fn build_levels(records: &[SegmentRecord], max_levels: usize) -> Vec<Vec<Arc<SegmentRecord>>> {
    let mut levels: Vec<Vec<Arc<SegmentRecord>>> = vec![Vec::new(); max_levels];
    for record in records {
        let level = (record.level as usize).min(max_levels - 1);
        levels[level].push(Arc::new(record.clone()));
    }
    levels[0].sort_by(|a, b| b.max_seq.cmp(&a.max_seq));
    for level in levels.iter_mut().skip(1) {
        level.sort_by(|a, b| a.min_key.cmp(&b.min_key));
    }
    levels
}

/// Deepest level holding any segment that overlaps `[start, end)`.
fn deepest_populated_level(
    levels: &[Vec<Arc<SegmentRecord>>],
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> usize {
    levels
        .iter()
        .enumerate()
        .rev()
        .find(|(_, segments)| segments.iter().any(|s| s.overlaps_range(start, end)))
        .map(|(level, _)| level)
        .unwrap_or(0)
}

fn collect_mem_range<'a>(
    iter: impl Iterator<Item = (&'a [u8], &'a crate::memtable::Version)>,
) -> Vec<Entry> {
    iter.map(|(key, version)| Entry {
        key: key.to_vec(),
        value: version.value.clone(),
        seq: version.seq,
    })
    .collect()
}

/// Delete segment and WAL files the manifest does not reference, plus
/// leftover temp files.  Runs at open, before anything new is created.
fn sweep_orphans(
    segment_dir: &Path,
    wal_dir: &Path,
    manifest: &Manifest,
) -> Result<(), EngineError> {
    if segment_dir.exists() {
        let live: Vec<String> = manifest
            .segments()
            .iter()
            .map(|s| segment_file_name(s.id))
            .collect();
        for entry in fs::read_dir(segment_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !live.iter().any(|l| l == name) {
                warn!(path = %path.display(), "sweeping orphan segment file");
                remove_file_logged(&path);
            }
        }
    }

    if wal_dir.exists() {
        let mut live: Vec<String> = manifest
            .frozen_wals()
            .iter()
            .map(|&g| wal_file_name(g))
            .collect();
        live.push(wal_file_name(manifest.active_wal()));
        for entry in fs::read_dir(wal_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !live.iter().any(|l| l == name) {
                warn!(path = %path.display(), "sweeping orphan wal file");
                remove_file_logged(&path);
            }
        }
    }
    Ok(())
}

fn remove_file_logged(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        warn!(path = %path.display(), %error, "failed to remove file");
    } else {
        debug!(path = %path.display(), "removed file");
    }
}
