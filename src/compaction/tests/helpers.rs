use crate::compaction::LevelPolicy;
use crate::engine::entry::Entry;
use crate::manifest::SegmentRecord;
use crate::segment::{SegmentWriter, segment_file_name};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by the `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Policy with small budgets so tests trigger quickly.
pub fn test_policy() -> LevelPolicy {
    LevelPolicy {
        l0_compaction_threshold: 4,
        level_base_size: 4096,
        level_size_multiplier: 10,
        max_levels: 7,
    }
}

/// Metadata-only record for picker tests; no file behind it.
pub fn meta(id: u64, level: u32, min_key: &[u8], max_key: &[u8], file_size: u64) -> Arc<SegmentRecord> {
    Arc::new(SegmentRecord {
        id,
        level,
        min_key: min_key.to_vec(),
        max_key: max_key.to_vec(),
        max_seq: id * 100,
        file_size,
        entry_count: 8,
    })
}

/// Write `entries` to a real segment file and return its record.
pub fn build_segment(
    dir: &Path,
    id: u64,
    level: u32,
    entries: &[Entry],
) -> Arc<SegmentRecord> {
    let path = dir.join(segment_file_name(id));
    let mut writer = SegmentWriter::create(&path).unwrap();
    for entry in entries {
        writer.add(entry).unwrap();
    }
    let stats = writer.finish().unwrap();
    Arc::new(SegmentRecord {
        id,
        level,
        min_key: stats.min_key,
        max_key: stats.max_key,
        max_seq: stats.max_seq,
        file_size: stats.file_size,
        entry_count: stats.entry_count,
    })
}

/// Seven empty levels, the shape the engine hands to the pickers.
pub fn empty_levels() -> Vec<Vec<Arc<SegmentRecord>>> {
    vec![Vec::new(); 7]
}
