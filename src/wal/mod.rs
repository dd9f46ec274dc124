//! Write-ahead log — generic, append-only, checksummed.
//!
//! [`Wal<T>`] persists any [`WalRecord`] type to an append-only file and
//! replays it after a crash.  The memtable logs its mutations through it
//! and the manifest logs its edits through it.
//!
//! # File layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ header: [magic "SWAL"][version u32][max_record u32]    │
//! │         [generation u64][crc32 u32]                    │
//! ├────────────────────────────────────────────────────────┤
//! │ record: [u32 len][payload bytes][crc32 over len‖bytes] │
//! │ record: …                                              │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `append` syncs to disk before returning, so an acknowledged
//! record survives a crash.
//!
//! # Torn tails
//!
//! A crash mid-append leaves a partial record at the end of the file.
//! Replay reports it as an error for which [`WalError::is_torn_tail`]
//! returns `true`; callers stop replay there and repair the file with
//! [`Wal::truncate_to`] at the iterator's last valid offset.  A damaged
//! header, by contrast, is unrecoverable corruption.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Magic bytes at offset 0 of every WAL file.
pub const WAL_MAGIC: [u8; 4] = *b"SWAL";

/// Current WAL format version.
pub const WAL_VERSION: u32 = 1;

/// Total header size: magic(4) + version(4) + max_record(4) + generation(8) + crc32(4).
pub const WAL_HEADER_SIZE: u64 = 24;

/// Default cap on a single encoded record (64 MiB).
pub const DEFAULT_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Per-record framing overhead: length prefix + trailing checksum.
const RECORD_OVERHEAD: u64 = 8;

/// File name of the log for a given memtable generation, e.g. `wal-000007.log`.
pub fn wal_file_name(generation: u64) -> String {
    format!("wal-{generation:06}.log")
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying file I/O failed.
    #[error("wal i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A record failed to encode or decode structurally.
    #[error("wal encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file header is missing, malformed, or fails its checksum.
    #[error("invalid wal header: {0}")]
    InvalidHeader(String),

    /// A record checksum did not match its payload.
    #[error("wal checksum mismatch at offset {offset} (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch {
        /// File offset of the failing record's length prefix.
        offset: u64,
        /// Checksum stored in the file.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// The file ended inside a record, or a length prefix is implausible.
    #[error("truncated wal record at offset {offset}")]
    TruncatedRecord {
        /// File offset of the failing record's length prefix.
        offset: u64,
    },

    /// An encoded record exceeded the configured maximum size.
    #[error("wal record of {size} bytes exceeds maximum {max}")]
    RecordTooLarge {
        /// Encoded record size.
        size: usize,
        /// Configured maximum.
        max: u32,
    },
}

impl WalError {
    /// `true` for the failure modes a crash mid-append produces.
    ///
    /// Replay callers treat these as the end of the log and repair the
    /// file; everything else is surfaced as corruption.
    pub fn is_torn_tail(&self) -> bool {
        matches!(
            self,
            WalError::ChecksumMismatch { .. } | WalError::TruncatedRecord { .. }
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Record trait
// ------------------------------------------------------------------------------------------------

/// Marker for types that can be logged: encodable, decodable, debuggable.
pub trait WalRecord: Encode + Decode + std::fmt::Debug {}

impl<T: Encode + Decode + std::fmt::Debug> WalRecord for T {}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// Append-only, checksummed log of `T` records.
pub struct Wal<T: WalRecord> {
    file: File,
    path: PathBuf,
    generation: u64,
    max_record_size: u32,
    _record: PhantomData<T>,
}

impl<T: WalRecord> Wal<T> {
    /// Create a fresh WAL at `path`, writing and syncing the header.
    ///
    /// Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, generation: u64) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = encode_header(generation, DEFAULT_MAX_RECORD_SIZE);
        file.write_all(&header)?;
        file.sync_all()?;

        debug!(path = %path.display(), generation, "created wal");
        Ok(Self {
            file,
            path,
            generation,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            _record: PhantomData,
        })
    }

    /// Open an existing WAL, validating its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; WAL_HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|e| {
            WalError::InvalidHeader(format!("header shorter than {WAL_HEADER_SIZE} bytes: {e}"))
        })?;
        let (generation, max_record_size) = decode_header(&header)?;

        file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), generation, "opened wal");
        Ok(Self {
            file,
            path,
            generation,
            max_record_size,
            _record: PhantomData,
        })
    }

    /// Append one record and sync it to disk.
    pub fn append(&mut self, record: &T) -> Result<(), WalError> {
        let mut payload = Vec::new();
        record.encode_to(&mut payload)?;
        if payload.len() > self.max_record_size as usize {
            return Err(WalError::RecordTooLarge {
                size: payload.len(),
                max: self.max_record_size,
            });
        }

        let len = payload.len() as u32;
        let mut frame = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        self.file.write_all(&frame)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Iterate over every record in append order.
    ///
    /// The iterator reads from an independent file handle, so replay can
    /// run while the `Wal` keeps its append position.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        Ok(WalIter {
            reader: BufReader::new(file),
            offset: WAL_HEADER_SIZE,
            max_record_size: self.max_record_size,
            failed: false,
            _record: PhantomData,
        })
    }

    /// Discard every record, keeping the header.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        self.truncate_to(WAL_HEADER_SIZE)
    }

    /// Shrink the file to `offset` bytes, used to repair a torn tail.
    ///
    /// `offset` never goes below the header.
    pub fn truncate_to(&mut self, offset: u64) -> Result<(), WalError> {
        let offset = offset.max(WAL_HEADER_SIZE);
        self.file.set_len(offset)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_all()?;
        debug!(path = %self.path.display(), offset, "truncated wal");
        Ok(())
    }

    /// Flush pending writes to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generation number stamped into the header.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T: WalRecord> Drop for Wal<T> {
    fn drop(&mut self) {
        if let Err(error) = self.file.sync_all() {
            warn!(path = %self.path.display(), %error, "wal sync on drop failed");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replay iterator
// ------------------------------------------------------------------------------------------------

/// Streaming reader over WAL records.
///
/// Yields `Ok(record)` per intact record and stops at clean EOF.  The
/// first error ends iteration; if [`WalError::is_torn_tail`] holds for
/// it, [`WalIter::valid_offset`] is the length of the intact prefix.
pub struct WalIter<T: WalRecord> {
    reader: BufReader<File>,
    offset: u64,
    max_record_size: u32,
    failed: bool,
    _record: PhantomData<T>,
}

impl<T: WalRecord> WalIter<T> {
    /// File offset just past the last record returned successfully.
    pub fn valid_offset(&self) -> u64 {
        self.offset
    }

    fn read_record(&mut self) -> Result<Option<T>, WalError> {
        let mut len_bytes = [0u8; 4];
        match read_full(&mut self.reader, &mut len_bytes)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(WalError::TruncatedRecord { offset: self.offset }),
        }

        let len = u32::from_le_bytes(len_bytes);
        // A garbage length prefix is indistinguishable from a torn write.
        if len > self.max_record_size {
            return Err(WalError::TruncatedRecord { offset: self.offset });
        }

        let mut payload = vec![0u8; len as usize];
        if read_full(&mut self.reader, &mut payload)? != payload.len() {
            return Err(WalError::TruncatedRecord { offset: self.offset });
        }

        let mut crc_bytes = [0u8; 4];
        if read_full(&mut self.reader, &mut crc_bytes)? != 4 {
            return Err(WalError::TruncatedRecord { offset: self.offset });
        }
        let expected = u32::from_le_bytes(crc_bytes);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_bytes);
        hasher.update(&payload);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(WalError::ChecksumMismatch {
                offset: self.offset,
                expected,
                actual,
            });
        }

        let (record, consumed) = T::decode_from(&payload)?;
        if consumed != payload.len() {
            return Err(WalError::Encoding(EncodingError::Custom(format!(
                "record decoded {consumed} of {} payload bytes",
                payload.len()
            ))));
        }

        self.offset += RECORD_OVERHEAD + u64::from(len);
        Ok(Some(record))
    }
}

impl<T: WalRecord> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    // Fused: once a record fails, later reads would start misaligned
    // and decode garbage, so the first error is also the last item.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.read_record().transpose();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}

/// Read until `buf` is full or EOF, returning the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, WalError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ------------------------------------------------------------------------------------------------
// Header codec
// ------------------------------------------------------------------------------------------------

fn encode_header(generation: u64, max_record_size: u32) -> [u8; WAL_HEADER_SIZE as usize] {
    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&WAL_MAGIC);
    header[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&max_record_size.to_le_bytes());
    header[12..20].copy_from_slice(&generation.to_le_bytes());
    let crc = crc32fast::hash(&header[0..20]);
    header[20..24].copy_from_slice(&crc.to_le_bytes());
    header
}

fn decode_header(header: &[u8; WAL_HEADER_SIZE as usize]) -> Result<(u64, u32), WalError> {
    if header[0..4] != WAL_MAGIC {
        return Err(WalError::InvalidHeader("bad magic bytes".into()));
    }

    let stored_crc = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
    let actual_crc = crc32fast::hash(&header[0..20]);
    if stored_crc != actual_crc {
        return Err(WalError::InvalidHeader(format!(
            "header checksum mismatch (expected {stored_crc:#010x}, got {actual_crc:#010x})"
        )));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != WAL_VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {version} (expected {WAL_VERSION})"
        )));
    }

    let max_record_size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let generation = u64::from_le_bytes([
        header[12], header[13], header[14], header[15], header[16], header[17], header[18],
        header[19],
    ]);
    Ok((generation, max_record_size))
}
