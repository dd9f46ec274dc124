//! StrataKV is an embeddable, persistent key-value store built on a
//! leveled LSM-tree.
//!
//! Writes land in an in-memory memtable guarded by a write-ahead log;
//! full memtables are frozen and flushed to immutable, sorted segment
//! files; a background compaction engine merges segments down through
//! levels to bound read amplification and reclaim deleted keys.  A
//! manifest with an atomically swapped `CURRENT` pointer records which
//! files make up the store, so crashes at any point recover to a
//! consistent state.
//!
//! ```no_run
//! use stratakv::{Options, Store};
//!
//! # fn main() -> Result<(), stratakv::StoreError> {
//! let store = Store::open("/tmp/stratakv-demo", Options::default())?;
//! store.put(b"planet", b"earth")?;
//! assert_eq!(store.get(b"planet")?, Some(b"earth".to_vec()));
//! store.delete(b"planet")?;
//! assert_eq!(store.get(b"planet")?, None);
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod segment;
pub mod wal;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use thiserror::Error;
use tracing::{error, info, warn};

use engine::{Engine, EngineConfig, EngineError, EngineStats, MANIFEST_DIR, SEGMENT_DIR, WAL_DIR};
use manifest::ManifestError;
use segment::SegmentError;
use wal::WalError;

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Tuning and open-behavior knobs for a [`Store`].
///
/// The defaults suit small to medium embedded workloads; every field
/// can be overridden before [`Store::open`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the store if it does not exist.
    pub create_if_missing: bool,
    /// Fail [`Store::open`] if the store already exists.
    pub error_if_exists: bool,
    /// Memtable size that triggers a flush, in bytes.
    pub write_buffer_size: usize,
    /// Upper bound on concurrently mmap'd segment files.
    pub max_open_files: usize,
    /// L0 segment count that triggers compaction into L1.
    pub l0_compaction_threshold: usize,
    /// Byte budget for L1; each deeper level gets ten times the
    /// previous one.
    pub level_base_size: u64,
    /// Target size of segment files produced by compaction.
    pub segment_target_size: u64,
    /// Background worker threads for flush and compaction.
    pub background_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 256,
            l0_compaction_threshold: 4,
            level_base_size: 8 * 1024 * 1024,
            segment_target_size: 2 * 1024 * 1024,
            background_threads: 1,
        }
    }
}

impl Options {
    const LEVEL_SIZE_MULTIPLIER: u64 = 10;
    const MAX_LEVELS: usize = 7;

    fn validate(&self) -> Result<(), StoreError> {
        if self.write_buffer_size == 0 {
            return Err(StoreError::InvalidArgument(
                "write_buffer_size must be non-zero".into(),
            ));
        }
        if self.max_open_files == 0 {
            return Err(StoreError::InvalidArgument(
                "max_open_files must be non-zero".into(),
            ));
        }
        if self.l0_compaction_threshold < 2 {
            return Err(StoreError::InvalidArgument(
                "l0_compaction_threshold must be at least 2".into(),
            ));
        }
        if self.level_base_size == 0 || self.segment_target_size == 0 {
            return Err(StoreError::InvalidArgument(
                "level_base_size and segment_target_size must be non-zero".into(),
            ));
        }
        if self.background_threads == 0 {
            return Err(StoreError::InvalidArgument(
                "background_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn engine_config(&self, data_dir: PathBuf) -> EngineConfig {
        EngineConfig {
            data_dir,
            create_if_missing: self.create_if_missing,
            error_if_exists: self.error_if_exists,
            write_buffer_size: self.write_buffer_size,
            max_open_files: self.max_open_files,
            l0_compaction_threshold: self.l0_compaction_threshold,
            level_base_size: self.level_base_size,
            level_size_multiplier: Self::LEVEL_SIZE_MULTIPLIER,
            segment_target_size: self.segment_target_size,
            max_levels: Self::MAX_LEVELS,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the public [`Store`] API.
///
/// A missing key is never an error: [`Store::get`] answers `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored data failed validation: bad magic, checksum mismatch, or
    /// an undecodable structure.  The affected data cannot be trusted.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The operating system refused a file operation.  The store
    /// remains usable; the operation may be retried.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Caller misuse: empty key, invalid options, or opening a missing
    /// store without `create_if_missing`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A resource limit was hit, such as a record too large for the
    /// write-ahead log.  The store remains usable.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The store was closed; no further operations are accepted.
    #[error("store is closed")]
    Closed,
}

impl From<EngineError> for StoreError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Io(e) => StoreError::Io(e),
            EngineError::Wal(e) => wal_error(e),
            EngineError::Memtable(memtable::MemtableError::Wal(e)) => wal_error(e),
            EngineError::Segment(e) => segment_error(e),
            EngineError::Manifest(e) => manifest_error(e),
            EngineError::Compaction(e) => match e {
                compaction::CompactionError::Segment(e) => segment_error(e),
                compaction::CompactionError::Io(e) => StoreError::Io(e),
            },
            EngineError::InvalidArgument(msg) => StoreError::InvalidArgument(msg),
            EngineError::AlreadyExists(msg) => {
                StoreError::InvalidArgument(format!("store already exists: {msg}"))
            }
            EngineError::Internal(msg) => StoreError::Corruption(msg),
        }
    }
}

fn wal_error(error: WalError) -> StoreError {
    match error {
        WalError::Io(e) => StoreError::Io(e),
        e @ WalError::RecordTooLarge { .. } => StoreError::ResourceExhausted(e.to_string()),
        other => StoreError::Corruption(other.to_string()),
    }
}

fn segment_error(error: SegmentError) -> StoreError {
    match error {
        SegmentError::Io(e) => StoreError::Io(e),
        SegmentError::OutOfOrder(msg) => StoreError::InvalidArgument(msg),
        other => StoreError::Corruption(other.to_string()),
    }
}

fn manifest_error(error: ManifestError) -> StoreError {
    match error {
        ManifestError::Io(e) => StoreError::Io(e),
        ManifestError::Wal(e) => wal_error(e),
        other => StoreError::Corruption(other.to_string()),
    }
}

// ------------------------------------------------------------------------------------------------
// Background workers
// ------------------------------------------------------------------------------------------------

type Task = Box<dyn FnOnce() + Send>;

/// Fixed pool of worker threads fed over a crossbeam channel.  Dropping
/// the sender drains the queue and lets the workers exit.
struct BackgroundPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundPool {
    fn start(threads: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver = receiver.clone();
            let builder = std::thread::Builder::new().name(format!("stratakv-bg-{id}"));
            match builder.spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            }) {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(%e, "failed to spawn background worker"),
            }
        }
        Self {
            sender: Some(sender),
            workers,
        }
    }

    fn submit(&self, task: Task) {
        if let Some(sender) = &self.sender
            && sender.send(task).is_err()
        {
            warn!("background pool is shut down, task dropped");
        }
    }

    /// Finish queued work, then join every worker.
    fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("background worker panicked");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

/// Handle to an open store.  Thread-safe; share by reference or wrap in
/// an `Arc`.
pub struct Store {
    engine: Arc<Engine>,
    pool: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl Store {
    /// Open the store at `path`, creating it according to `options`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self, StoreError> {
        options.validate()?;
        let engine = Engine::open(options.engine_config(path.as_ref().to_path_buf()))?;
        Ok(Self {
            engine: Arc::new(engine),
            pool: Mutex::new(Some(BackgroundPool::start(options.background_threads))),
            closed: AtomicBool::new(false),
        })
    }

    /// Insert or overwrite `key → value`.
    ///
    /// Durable once this returns: the write is synced to the WAL before
    /// the in-memory state changes.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        check_key(key)?;
        if self.engine.put(key, value)? {
            self.schedule_maintenance();
        }
        Ok(())
    }

    /// Delete `key`.  Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        check_key(key)?;
        if self.engine.delete(key)? {
            self.schedule_maintenance();
        }
        Ok(())
    }

    /// Look up `key`.  `Ok(None)` for a missing or deleted key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        check_key(key)?;
        Ok(self.engine.get(key)?)
    }

    /// All live key-value pairs with `start <= key < end`, in ascending
    /// key order.  `None` bounds are unbounded.
    pub fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.check_open()?;
        Ok(self.engine.scan(start, end)?)
    }

    /// Persist all buffered writes to segment files before returning.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.engine.flush()?)
    }

    /// Compact every segment whose key range intersects `[start, end)`
    /// down to the deepest populated level, synchronously.  Buffered
    /// writes in the range are flushed first.
    pub fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.engine.compact_range(start, end)?)
    }

    /// Operation counters and layer sizes.
    pub fn stats(&self) -> Result<EngineStats, StoreError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    /// Flush buffered writes, finish background work, and release the
    /// store.  Idempotent; operations after `close` fail with
    /// [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut guard) = self.pool.lock()
            && let Some(mut pool) = guard.take()
        {
            pool.shutdown();
        }
        self.engine.flush()?;
        info!(data_dir = %self.engine.data_dir().display(), "store closed");
        Ok(())
    }

    /// Remove the store at `path` entirely: segments, WALs, manifest,
    /// and the directories themselves.  A missing store is `Ok`.
    ///
    /// Must not be called while the store is open.
    pub fn destroy(path: impl AsRef<Path>) -> Result<(), StoreError> {
        let root = path.as_ref();
        if !root.exists() {
            return Ok(());
        }
        // Best effort: every subdirectory is attempted, the first
        // failure is reported once the sweep finishes.
        let mut first_error: Option<io::Error> = None;
        for sub in [WAL_DIR, SEGMENT_DIR, MANIFEST_DIR] {
            let dir = root.join(sub);
            if !dir.exists() {
                continue;
            }
            if let Err(error) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), %error, "failed to remove store subdirectory");
                first_error.get_or_insert(error);
            }
        }
        // Remove the root only if nothing foreign lives in it.
        match fs::remove_dir(root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                warn!(path = %root.display(), "store destroyed but directory not empty, leaving it");
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
        if let Some(error) = first_error {
            return Err(error.into());
        }
        info!(path = %root.display(), "store destroyed");
        Ok(())
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Queue a flush-then-compact pass on the background pool.
    fn schedule_maintenance(&self) {
        let Ok(guard) = self.pool.lock() else { return };
        let Some(pool) = guard.as_ref() else { return };
        let engine = Arc::clone(&self.engine);
        pool.submit(Box::new(move || {
            if let Err(error) = engine.flush_pending() {
                error!(%error, "background flush failed");
                return;
            }
            if let Err(error) = engine.maybe_compact() {
                error!(%error, "background compaction failed");
            }
        }));
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(%error, "error while closing store on drop");
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}
