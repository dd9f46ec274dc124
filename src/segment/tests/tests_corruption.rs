//! Segment corruption detection.
//!
//! Corruption is simulated by rewriting bytes of the published file.
//! Coverage:
//! - header magic flip → open fails
//! - footer byte flip → open fails
//! - data block byte flip → the read that touches the block fails with
//!   `SegmentError::ChecksumMismatch`, opening still succeeds
//! - truncated file → open fails

#[cfg(test)]
mod tests {
    use crate::segment::tests::helpers::*;
    use crate::segment::{Segment, SegmentError, SEGMENT_HEADER_SIZE};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;
    use tempfile::TempDir;

    fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(bytes).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_bad_magic_rejected_on_open() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let (path, _) = write_segment(tmp.path(), 1, &sequential_entries(10));

        overwrite(&path, 0, b"ZZZZ");
        assert!(Segment::open(1, &path).is_err());
    }

    #[test]
    fn test_footer_flip_rejected_on_open() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let (path, stats) = write_segment(tmp.path(), 1, &sequential_entries(10));

        // Last byte of the footer checksum.
        overwrite(&path, stats.file_size - 1, &[0x5a]);
        assert!(Segment::open(1, &path).is_err());
    }

    /// # Scenario
    /// One byte inside the first data block is flipped after the
    /// segment was published.
    ///
    /// # Expected behavior
    /// Opening succeeds (header, footer, and metadata are intact); the
    /// lookup that reads the damaged block reports a checksum mismatch
    /// instead of returning bad data.
    #[test]
    fn test_data_block_flip_detected_on_read() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let (path, _) = write_segment(tmp.path(), 1, &sequential_entries(10));

        // 8 bytes into the first block frame, past its length prefix.
        overwrite(&path, SEGMENT_HEADER_SIZE + 8, &[0xee]);

        let segment = Segment::open(1, &path).unwrap();
        let result = segment.get(b"key-000003");
        assert!(matches!(
            result,
            Err(SegmentError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file_rejected_on_open() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let (path, stats) = write_segment(tmp.path(), 1, &sequential_entries(10));

        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(stats.file_size / 2)
            .unwrap();
        assert!(Segment::open(1, &path).is_err());
    }
}
