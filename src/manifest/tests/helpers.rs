use crate::manifest::SegmentRecord;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by the `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Segment record spanning `[min_key, max_key]` with token sizes.
pub fn record(id: u64, level: u32, min_key: &[u8], max_key: &[u8]) -> SegmentRecord {
    SegmentRecord {
        id,
        level,
        min_key: min_key.to_vec(),
        max_key: max_key.to_vec(),
        max_seq: id * 10,
        file_size: 1024,
        entry_count: 8,
    }
}
