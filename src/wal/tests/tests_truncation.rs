//! Torn-tail repair and explicit truncation.

#[cfg(test)]
mod tests {
    use crate::wal::tests::helpers::*;
    use crate::wal::{WAL_HEADER_SIZE, Wal, wal_file_name};
    use std::fs::{self, OpenOptions};
    use tempfile::TempDir;

    /// # Scenario
    /// A crash mid-append leaves half a record at the end of the file.
    ///
    /// # Actions
    /// 1. Append two records, note the file length.
    /// 2. Append a third, then chop the file 3 bytes short.
    /// 3. Replay, then repair with `truncate_to` at the valid offset.
    ///
    /// # Expected behavior
    /// Replay returns the two intact records and a torn-tail error;
    /// after repair the file replays cleanly.
    #[test]
    fn test_torn_tail_repair_cycle() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        let mut wal = Wal::create(&path, 0).unwrap();
        wal.append(&mutation(1, b"a", Some(b"1"))).unwrap();
        wal.append(&mutation(2, b"b", Some(b"2"))).unwrap();
        let intact_len = fs::metadata(&path).unwrap().len();
        wal.append(&mutation(3, b"c", Some(b"3"))).unwrap();
        drop(wal);

        let torn_len = fs::metadata(&path).unwrap().len() - 3;
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(torn_len)
            .unwrap();

        let mut wal: Wal<MutationRecord> = Wal::open(&path).unwrap();
        let mut iter = wal.replay_iter().unwrap();
        assert_eq!(iter.next().unwrap().unwrap().seq, 1);
        assert_eq!(iter.next().unwrap().unwrap().seq, 2);
        let error = iter.next().unwrap().unwrap_err();
        assert!(error.is_torn_tail());
        let valid = iter.valid_offset();
        assert_eq!(valid, intact_len);
        drop(iter);

        wal.truncate_to(valid).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        let replayed = collect_records(&wal).unwrap();
        assert_eq!(replayed.len(), 2);
    }

    /// # Scenario
    /// `truncate` discards every record but keeps the header.
    #[test]
    fn test_truncate_keeps_header() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        let mut wal = Wal::create(&path, 0).unwrap();
        wal.append(&mutation(1, b"a", Some(b"1"))).unwrap();

        wal.truncate().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE);
        assert!(collect_records(&wal).unwrap().is_empty());

        // The log accepts appends again after truncation.
        wal.append(&mutation(9, b"z", None)).unwrap();
        assert_eq!(collect_records(&wal).unwrap()[0].seq, 9);
    }

    /// # Scenario
    /// `truncate_to` with an offset inside the header is clamped.
    #[test]
    fn test_truncate_to_never_cuts_header() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(wal_file_name(0));
        let mut wal: Wal<MutationRecord> = Wal::create(&path, 0).unwrap();

        wal.truncate_to(3).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE);

        drop(wal);
        assert!(Wal::<MutationRecord>::open(&path).is_ok());
    }
}
