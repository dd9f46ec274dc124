//! Bounded cache of open segment readers.
//!
//! Each open [`Segment`] pins a file descriptor and an mmap, so the
//! store caps them at `max_open_files`.  [`SegmentCache`] opens
//! segments lazily on first use and evicts the least recently used one
//! when the cap is reached.
//!
//! Deletion goes through the cache: a segment retired by compaction is
//! marked delete-on-drop, so its file disappears only after the last
//! in-flight read releases its `Arc`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{Segment, SegmentError};

struct Slot {
    segment: Arc<Segment>,
    last_used: u64,
}

struct CacheInner {
    map: HashMap<u64, Slot>,
    tick: u64,
}

/// LRU cache of open segments, keyed by segment id.
pub struct SegmentCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl SegmentCache {
    /// Cache holding at most `capacity` open segments.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Return the open segment for `id`, opening `path` on a miss.
    ///
    /// On a miss at capacity, the least recently used entry is evicted;
    /// its mmap closes once outstanding readers drop their handles.
    pub fn get(&self, id: u64, path: &Path) -> Result<Arc<Segment>, SegmentError> {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(slot) = inner.map.get_mut(&id) {
            slot.last_used = tick;
            return Ok(Arc::clone(&slot.segment));
        }

        if inner.map.len() >= self.capacity
            && let Some(&victim) = inner
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| id)
        {
            inner.map.remove(&victim);
            debug!(victim, "evicted segment from cache");
        }

        let segment = Arc::new(Segment::open(id, path)?);
        inner.map.insert(
            id,
            Slot {
                segment: Arc::clone(&segment),
                last_used: tick,
            },
        );
        Ok(segment)
    }

    /// Drop the cache entry for `id`, if any, returning the handle.
    pub fn remove(&self, id: u64) -> Option<Arc<Segment>> {
        self.lock().map.remove(&id).map(|slot| slot.segment)
    }

    /// Retire a segment: evict it and unlink its file once the last
    /// reader finishes.  When the segment was never opened, the file is
    /// removed directly.
    pub fn delete_segment(&self, id: u64, path: &Path) {
        match self.remove(id) {
            Some(segment) => segment.mark_delete_on_drop(),
            None => {
                if let Err(error) = std::fs::remove_file(path) {
                    warn!(id, path = %path.display(), %error, "failed to delete segment file");
                }
            }
        }
    }

    /// Number of cached open segments.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached handle.
    pub fn clear(&self) {
        self.lock().map.clear();
    }

    // A poisoned cache mutex only means a panic elsewhere mid-lookup;
    // the map itself stays consistent, so recover the guard.
    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
