use crate::engine::entry::Entry;
use crate::segment::{SegmentStats, SegmentWriter, segment_file_name};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by the `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write `entries` (already in `(key ASC, seq DESC)` order) to a
/// segment file named after `id` under `dir`.
pub fn write_segment(dir: &Path, id: u64, entries: &[Entry]) -> (PathBuf, SegmentStats) {
    let path = dir.join(segment_file_name(id));
    let mut writer = SegmentWriter::create(&path).unwrap();
    for entry in entries {
        writer.add(entry).unwrap();
    }
    let stats = writer.finish().unwrap();
    (path, stats)
}

/// `count` puts with zero-padded keys, values `val-N`, seqs 1..=count.
pub fn sequential_entries(count: u64) -> Vec<Entry> {
    (0..count)
        .map(|i| Entry::put(format!("key-{i:06}"), format!("val-{i}"), i + 1))
        .collect()
}
