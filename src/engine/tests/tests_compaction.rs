//! Compaction through the engine: automatic triggers and range
//! compaction.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, SEGMENT_DIR};
    use crate::segment::{SegmentGet, segment_file_name};
    use std::fs;
    use tempfile::TempDir;

    fn fill(engine: &Engine, start: u32, count: u32) {
        for i in start..start + count {
            engine
                .put(format!("key-{i:06}").as_bytes(), &[b'v'; 24])
                .unwrap();
        }
    }

    /// # Scenario
    /// Enough flushes to exceed the L0 threshold, then an automatic
    /// compaction pass.
    ///
    /// # Expected behavior
    /// L0 drains into L1 and every key stays readable.
    #[test]
    fn compaction__l0_drains_into_l1() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        for batch in 0..4u32 {
            fill(&engine, batch * 10, 10);
            engine.flush().unwrap();
        }
        assert!(engine.stats().unwrap().segments_per_level[0] >= 2);

        engine.maybe_compact().unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.segments_per_level[0], 0);
        assert!(stats.segments_per_level[1] >= 1);
        assert!(stats.compactions >= 1);

        for i in 0..40u32 {
            let key = format!("key-{i:06}");
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(vec![b'v'; 24]),
                "key {key}"
            );
        }
    }

    /// # Scenario
    /// Overlapping L0 segments hold different versions of a key, then
    /// compaction merges them.
    ///
    /// # Expected behavior
    /// Only the newest version survives, before and after the merge.
    #[test]
    fn compaction__newest_version_survives_merge() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        engine.put(b"key", b"v1").unwrap();
        engine.flush().unwrap();
        engine.put(b"key", b"v2").unwrap();
        engine.flush().unwrap();
        engine.put(b"key", b"v3").unwrap();
        engine.flush().unwrap();

        engine.maybe_compact().unwrap();
        assert_eq!(engine.get(b"key").unwrap(), Some(b"v3".to_vec()));
    }

    /// # Scenario
    /// A deleted key is compacted with no deeper levels populated.
    ///
    /// # Expected behavior
    /// Tombstone and value are both gone from disk and the key reads
    /// as absent.
    #[test]
    fn compaction__tombstones_collected_at_bottom() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        engine.put(b"doomed", b"value").unwrap();
        engine.put(b"keeper", b"value").unwrap();
        engine.flush().unwrap();
        engine.delete(b"doomed").unwrap();
        engine.flush().unwrap();

        engine.compact_range(None, None).unwrap();

        assert_eq!(engine.get(b"doomed").unwrap(), None);
        assert_eq!(engine.get(b"keeper").unwrap(), Some(b"value".to_vec()));

        let scanned = engine.scan(None, None).unwrap();
        assert_eq!(scanned.len(), 1);
    }

    /// # Scenario
    /// compact_range with buffered writes still in the memtable.
    ///
    /// # Expected behavior
    /// The buffered data is flushed first and participates in the
    /// merge.
    #[test]
    fn compaction__range_includes_memtable_data() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        engine.put(b"key", b"old").unwrap();
        engine.flush().unwrap();
        engine.put(b"key", b"new").unwrap();

        engine.compact_range(None, None).unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.active_memtable_bytes, 0);
        assert_eq!(stats.segments_per_level[0], 0);
        assert_eq!(engine.get(b"key").unwrap(), Some(b"new".to_vec()));
    }

    /// # Scenario
    /// A bounded compact_range touching only part of the keyspace.
    ///
    /// # Expected behavior
    /// Segments outside the range stay at L0.
    #[test]
    fn compaction__bounded_range_leaves_rest_alone() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        engine.put(b"aaa", b"left").unwrap();
        engine.flush().unwrap();
        engine.put(b"zzz", b"right").unwrap();
        engine.flush().unwrap();

        engine.compact_range(Some(b"a"), Some(b"b")).unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.segments_per_level[0], 1);
        assert_eq!(stats.segments_per_level[1], 1);
        assert_eq!(engine.get(b"aaa").unwrap(), Some(b"left".to_vec()));
        assert_eq!(engine.get(b"zzz").unwrap(), Some(b"right".to_vec()));
    }

    /// # Scenario
    /// Compaction inputs are removed from disk after the swap.
    ///
    /// # Expected behavior
    /// The segment directory holds exactly the live files.
    #[test]
    fn compaction__input_files_deleted() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        fill(&engine, 0, 20);
        engine.flush().unwrap();
        fill(&engine, 20, 20);
        engine.flush().unwrap();

        engine.compact_range(None, None).unwrap();

        let stats = engine.stats().unwrap();
        let live: usize = stats.segments_per_level.iter().sum();
        let on_disk = fs::read_dir(tmp.path().join(SEGMENT_DIR)).unwrap().count();
        assert_eq!(on_disk, live);
    }

    /// # Scenario
    /// A reader resolves a segment handle under the read lock, then a
    /// full-range compaction retires that segment before the probe
    /// runs.
    ///
    /// # Expected behavior
    /// The handle pins the file: the probe still answers from the
    /// retired segment, and the file disappears only once the handle
    /// drops.
    #[test]
    fn compaction__retired_segment_stays_readable_through_handle() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(multi_level_config(tmp.path())).unwrap();

        fill(&engine, 0, 20);
        engine.flush().unwrap();

        // Resolve a handle the way the read path does.
        let (segment, probe_key, path) = {
            let inner = engine.read_lock().unwrap();
            let record = &inner.levels[0][0];
            let path = tmp
                .path()
                .join(SEGMENT_DIR)
                .join(segment_file_name(record.id));
            (
                engine.resolve_segment(record).unwrap(),
                record.min_key.clone(),
                path,
            )
        };

        engine.compact_range(None, None).unwrap();
        assert_eq!(engine.stats().unwrap().segments_per_level[0], 0);

        assert!(path.exists());
        match segment.get(&probe_key).unwrap() {
            SegmentGet::Value(value, _) => assert_eq!(value, vec![b'v'; 24]),
            other => panic!("expected a value, got {other:?}"),
        }

        drop(segment);
        assert!(!path.exists());
    }
}
