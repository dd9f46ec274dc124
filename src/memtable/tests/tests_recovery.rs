//! WAL replay into a fresh memtable, including torn-tail repair.

#[cfg(test)]
mod tests {
    use crate::memtable::{Memtable, MemtableGet};
    use crate::wal::wal_file_name;
    use std::fs::{self, OpenOptions};
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// # Scenario
    /// A memtable is dropped without freezing (simulated crash) and
    /// recovered from its WAL.
    ///
    /// # Expected behavior
    /// Every acknowledged mutation is visible again, including the
    /// tombstone, and `max_seq` matches the last write.
    #[test]
    fn test_recover_replays_all_mutations() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(2));
        {
            let mut memtable = Memtable::create(&path, 2, 64 * 1024).unwrap();
            memtable.put(b"a", b"1", 1).unwrap();
            memtable.put(b"b", b"2", 2).unwrap();
            memtable.delete(b"a", 3).unwrap();
        }

        let recovered = Memtable::recover(&path, 64 * 1024).unwrap();
        assert_eq!(recovered.get(b"a"), MemtableGet::Tombstone);
        assert_eq!(recovered.get(b"b"), MemtableGet::Value(b"2".to_vec()));
        assert_eq!(recovered.max_seq(), 3);
        assert_eq!(recovered.generation(), 2);
    }

    /// # Scenario
    /// The WAL's last record is cut short by a crash.
    ///
    /// # Expected behavior
    /// Recovery keeps the intact prefix, truncates the file in place,
    /// and a second recovery sees a clean log.
    #[test]
    fn test_recover_repairs_torn_tail() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        let intact_len;
        {
            let mut memtable = Memtable::create(&path, 0, 64 * 1024).unwrap();
            memtable.put(b"a", b"1", 1).unwrap();
            intact_len = fs::metadata(&path).unwrap().len();
            memtable.put(b"b", b"2", 2).unwrap();
        }
        let torn_len = fs::metadata(&path).unwrap().len() - 2;
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(torn_len)
            .unwrap();

        let recovered = Memtable::recover(&path, 64 * 1024).unwrap();
        assert_eq!(recovered.get(b"a"), MemtableGet::Value(b"1".to_vec()));
        assert_eq!(recovered.get(b"b"), MemtableGet::NotFound);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        drop(recovered);
        let again = Memtable::recover(&path, 64 * 1024).unwrap();
        assert_eq!(again.max_seq(), 1);
    }

    /// # Scenario
    /// Recovery resumes appends on the repaired log.
    #[test]
    fn test_writes_continue_after_recovery() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        {
            let mut memtable = Memtable::create(&path, 0, 64 * 1024).unwrap();
            memtable.put(b"a", b"1", 1).unwrap();
        }

        let mut recovered = Memtable::recover(&path, 64 * 1024).unwrap();
        recovered.put(b"b", b"2", 2).unwrap();
        drop(recovered);

        let again = Memtable::recover(&path, 64 * 1024).unwrap();
        assert_eq!(again.get(b"a"), MemtableGet::Value(b"1".to_vec()));
        assert_eq!(again.get(b"b"), MemtableGet::Value(b"2".to_vec()));
    }
}
