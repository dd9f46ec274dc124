use crate::engine::EngineConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by the `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large write buffer: nothing ever leaves the memtable on its own.
pub fn memtable_only_config(dir: &Path) -> EngineConfig {
    init_tracing();
    EngineConfig {
        data_dir: dir.to_path_buf(),
        create_if_missing: true,
        error_if_exists: false,
        write_buffer_size: 64 * 1024,
        max_open_files: 64,
        l0_compaction_threshold: 4,
        level_base_size: 8 * 1024 * 1024,
        level_size_multiplier: 10,
        segment_target_size: 2 * 1024 * 1024,
        max_levels: 7,
    }
}

/// Small write buffer: a handful of writes forces a freeze.
pub fn small_buffer_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        write_buffer_size: 256,
        ..memtable_only_config(dir)
    }
}

/// Small buffer plus tiny level budgets so compactions trigger with
/// little data.
pub fn multi_level_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        write_buffer_size: 256,
        l0_compaction_threshold: 2,
        level_base_size: 2048,
        segment_target_size: 1024,
        ..memtable_only_config(dir)
    }
}
