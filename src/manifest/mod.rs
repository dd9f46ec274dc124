//! Store catalog: the manifest.
//!
//! The manifest is the authoritative record of what the store is made
//! of: the last assigned sequence number, the active WAL generation,
//! the frozen WAL generations awaiting flush, and every live segment
//! with its level and key range.
//!
//! # Durability
//!
//! Two cooperating forms:
//!
//! - an **edit log** (a [`Wal`] of [`ManifestEdit`] records) that every
//!   mutation appends to before changing the in-memory state, and
//! - periodic **snapshots** named `MANIFEST-NNNNNN`, each carrying a
//!   trailing CRC32, referenced by the `CURRENT` pointer file.
//!
//! [`Manifest::checkpoint`] writes a new snapshot to a temp file,
//! atomically renames it, flips `CURRENT` (again via temp + rename),
//! fsyncs the directory, and truncates the edit log.  Opening reverses
//! this: read `CURRENT`, load and verify the snapshot, replay the edit
//! log on top.  A crash at any point leaves either the old or the new
//! state reachable, never a mix.
//!
//! # Atomic layer transitions
//!
//! A flush installs its L0 segment and retires its WAL in a single
//! [`ManifestEdit::Flush`] record; a compaction installs its outputs
//! and removes its inputs in a single [`ManifestEdit::Compaction`]
//! record.  Level invariants (L1+ segments must not overlap siblings)
//! are enforced on apply and violations rejected as corruption.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

// ------------------------------------------------------------------------------------------------
// File names
// ------------------------------------------------------------------------------------------------

/// Pointer file naming the live snapshot.
pub const CURRENT_FILE: &str = "CURRENT";

/// Edit log file name within the manifest directory.
pub const EDIT_LOG_FILE: &str = "edits.log";

/// Snapshot file name for manifest version `n`, e.g. `MANIFEST-000003`.
pub fn snapshot_file_name(version: u64) -> String {
    format!("MANIFEST-{version:06}")
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying file I/O failed.
    #[error("manifest i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The edit log failed.
    #[error("manifest edit log error: {0}")]
    Wal(#[from] WalError),

    /// A snapshot or edit failed to encode or decode.
    #[error("manifest encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structural damage or an invariant-violating edit.
    #[error("manifest corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Catalog entry for one live segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub id: u64,
    pub level: u32,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub max_seq: u64,
    pub file_size: u64,
    pub entry_count: u64,
}

impl SegmentRecord {
    /// `true` when this segment's key range intersects `other`'s.
    pub fn overlaps(&self, other: &SegmentRecord) -> bool {
        self.min_key <= other.max_key && other.min_key <= self.max_key
    }

    /// `true` when this segment's key range intersects `[start, end)`,
    /// either bound optional.
    pub fn overlaps_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        if let Some(end) = end
            && self.min_key.as_slice() >= end
        {
            return false;
        }
        if let Some(start) = start
            && self.max_key.as_slice() < start
        {
            return false;
        }
        true
    }
}

impl Encode for SegmentRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.max_seq.encode_to(buf)?;
        self.file_size.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SegmentRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (id, mut offset) = u64::decode_from(buf)?;
        let (level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (file_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (entry_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                level,
                min_key,
                max_key,
                max_seq,
                file_size,
                entry_count,
            },
            offset,
        ))
    }
}

/// One logged catalog mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEdit {
    /// A fresh memtable WAL became active.
    SetActiveWal { generation: u64 },
    /// The previously active WAL froze with its memtable.
    AddFrozenWal { generation: u64 },
    /// A flush installed an L0 segment and retired its WAL.
    Flush {
        segment: SegmentRecord,
        wal_generation: u64,
    },
    /// A compaction swapped input segments for output segments.
    Compaction {
        added: Vec<SegmentRecord>,
        removed: Vec<u64>,
    },
    /// A frozen WAL was retired without producing a segment (its
    /// replay was empty).
    RemoveFrozenWal { generation: u64 },
    /// Sequence counter advanced (logged at freeze points).
    UpdateSeq { last_seq: u64 },
}

impl Encode for ManifestEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEdit::SetActiveWal { generation } => {
                0u32.encode_to(buf)?;
                generation.encode_to(buf)?;
            }
            ManifestEdit::AddFrozenWal { generation } => {
                1u32.encode_to(buf)?;
                generation.encode_to(buf)?;
            }
            ManifestEdit::Flush {
                segment,
                wal_generation,
            } => {
                2u32.encode_to(buf)?;
                segment.encode_to(buf)?;
                wal_generation.encode_to(buf)?;
            }
            ManifestEdit::Compaction { added, removed } => {
                3u32.encode_to(buf)?;
                encoding::encode_vec(added, buf)?;
                encoding::encode_vec(removed, buf)?;
            }
            ManifestEdit::RemoveFrozenWal { generation } => {
                4u32.encode_to(buf)?;
                generation.encode_to(buf)?;
            }
            ManifestEdit::UpdateSeq { last_seq } => {
                5u32.encode_to(buf)?;
                last_seq.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => {
                let (generation, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEdit::SetActiveWal { generation }, offset))
            }
            1 => {
                let (generation, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEdit::AddFrozenWal { generation }, offset))
            }
            2 => {
                let (segment, n) = SegmentRecord::decode_from(&buf[offset..])?;
                offset += n;
                let (wal_generation, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((
                    ManifestEdit::Flush {
                        segment,
                        wal_generation,
                    },
                    offset,
                ))
            }
            3 => {
                let (added, n) = encoding::decode_vec::<SegmentRecord>(&buf[offset..])?;
                offset += n;
                let (removed, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                Ok((ManifestEdit::Compaction { added, removed }, offset))
            }
            4 => {
                let (generation, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEdit::RemoveFrozenWal { generation }, offset))
            }
            5 => {
                let (last_seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEdit::UpdateSeq { last_seq }, offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other,
                type_name: "ManifestEdit",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// In-memory state
// ------------------------------------------------------------------------------------------------

/// The catalog itself.  Serialized verbatim into snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    /// Snapshot version, bumped by every checkpoint.
    pub version: u64,
    /// Highest sequence number recorded at a freeze point.  The true
    /// maximum after a crash also considers WAL replay.
    pub last_seq: u64,
    /// Generation of the WAL backing the active memtable.
    pub active_wal: u64,
    /// Generations of frozen, unflushed WALs, oldest first.
    pub frozen_wals: Vec<u64>,
    /// Every live segment, all levels.
    pub segments: Vec<SegmentRecord>,
    /// Next segment id to hand out.
    pub next_segment_id: u64,
}

impl ManifestData {
    fn initial() -> Self {
        Self {
            version: 0,
            last_seq: 0,
            active_wal: 1,
            frozen_wals: Vec::new(),
            segments: Vec::new(),
            next_segment_id: 1,
        }
    }
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        self.last_seq.encode_to(buf)?;
        self.active_wal.encode_to(buf)?;
        encoding::encode_vec(&self.frozen_wals, buf)?;
        encoding::encode_vec(&self.segments, buf)?;
        self.next_segment_id.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ManifestData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (version, mut offset) = u64::decode_from(buf)?;
        let (last_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (active_wal, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (frozen_wals, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        let (segments, n) = encoding::decode_vec::<SegmentRecord>(&buf[offset..])?;
        offset += n;
        let (next_segment_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                version,
                last_seq,
                active_wal,
                frozen_wals,
                segments,
                next_segment_id,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// Durable catalog handle.  Every mutator appends its edit to the log
/// before touching the in-memory state, so a crash replays cleanly.
pub struct Manifest {
    dir: PathBuf,
    wal: Wal<ManifestEdit>,
    data: ManifestData,
}

impl Manifest {
    /// `true` when `dir` already holds a manifest (a `CURRENT` file).
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        dir.as_ref().join(CURRENT_FILE).exists()
    }

    /// Initialize a fresh manifest in `dir` (which must exist and hold
    /// no `CURRENT`), writing the first snapshot immediately.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        // A crash between writing the edit log and the first checkpoint
        // leaves the log behind with no `CURRENT`; it references
        // nothing durable, so start over.
        let log_path = dir.join(EDIT_LOG_FILE);
        if log_path.exists() {
            warn!(path = %log_path.display(), "removing stale edit log from interrupted create");
            fs::remove_file(&log_path)?;
        }
        let wal = Wal::create(log_path, 0)?;
        let mut manifest = Self {
            dir: dir.clone(),
            wal,
            data: ManifestData::initial(),
        };
        manifest.checkpoint()?;
        info!(dir = %dir.display(), "created manifest");
        Ok(manifest)
    }

    /// Open the manifest in `dir`: follow `CURRENT`, verify and load the
    /// snapshot, then replay the edit log on top.
    ///
    /// A torn tail in the edit log (crash mid-append) is repaired; a
    /// corrupt snapshot or a structurally broken edit is surfaced.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();

        let current = fs::read_to_string(dir.join(CURRENT_FILE))?;
        let snapshot_name = current.trim();
        if snapshot_name.is_empty() {
            return Err(ManifestError::Corruption("CURRENT file is empty".into()));
        }
        let data = load_snapshot(&dir.join(snapshot_name))?;

        let wal: Wal<ManifestEdit> = Wal::open(dir.join(EDIT_LOG_FILE))?;
        let mut manifest = Self { dir, wal, data };

        let mut iter = manifest.wal.replay_iter()?;
        let mut repair_at = None;
        let mut replayed = 0u64;
        for result in iter.by_ref() {
            match result {
                Ok(edit) => {
                    apply_edit(&mut manifest.data, &edit)?;
                    replayed += 1;
                }
                Err(error) if error.is_torn_tail() => {
                    repair_at = Some(iter.valid_offset());
                    warn!(%error, "torn manifest edit log tail, truncating");
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }
        if let Some(offset) = repair_at {
            manifest.wal.truncate_to(offset)?;
        }

        info!(
            dir = %manifest.dir.display(),
            version = manifest.data.version,
            segments = manifest.data.segments.len(),
            replayed,
            "opened manifest"
        );
        Ok(manifest)
    }

    // --------------------------------------------------------------------------------------------
    // Mutators: log first, then apply.
    // --------------------------------------------------------------------------------------------

    /// Record that `generation` is now the active memtable WAL.
    pub fn set_active_wal(&mut self, generation: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEdit::SetActiveWal { generation })
    }

    /// Record that `generation` froze with its memtable.
    pub fn add_frozen_wal(&mut self, generation: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEdit::AddFrozenWal { generation })
    }

    /// Atomically install a flushed L0 segment and retire its WAL.
    pub fn record_flush(
        &mut self,
        segment: SegmentRecord,
        wal_generation: u64,
    ) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEdit::Flush {
            segment,
            wal_generation,
        })
    }

    /// Atomically swap compaction inputs for outputs.
    pub fn record_compaction(
        &mut self,
        added: Vec<SegmentRecord>,
        removed: Vec<u64>,
    ) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEdit::Compaction { added, removed })
    }

    /// Retire a frozen WAL that produced no segment.
    pub fn remove_frozen_wal(&mut self, generation: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEdit::RemoveFrozenWal { generation })
    }

    /// Persist the sequence counter high-water mark.
    pub fn update_seq(&mut self, last_seq: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEdit::UpdateSeq { last_seq })
    }

    fn log_and_apply(&mut self, edit: ManifestEdit) -> Result<(), ManifestError> {
        // Validate before logging so a rejected edit leaves no trace.
        validate_edit(&self.data, &edit)?;
        self.wal.append(&edit)?;
        apply_edit(&mut self.data, &edit)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoint
    // --------------------------------------------------------------------------------------------

    /// Fold the edit log into a fresh snapshot.
    ///
    /// Write order: snapshot temp file → fsync → rename → `CURRENT`
    /// temp → fsync → rename → directory fsync → edit log truncate →
    /// old snapshot removal.  Interrupting anywhere leaves a readable
    /// manifest.
    pub fn checkpoint(&mut self) -> Result<(), ManifestError> {
        let old_version = self.data.version;
        self.data.version += 1;
        let snapshot_name = snapshot_file_name(self.data.version);

        let mut payload = encoding::encode_to_vec(&self.data)?;
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());

        let snapshot_path = self.dir.join(&snapshot_name);
        let tmp_path = snapshot_path.with_extension("tmp");
        write_and_sync(&tmp_path, &payload)?;
        fs::rename(&tmp_path, &snapshot_path)?;

        let current_tmp = self.dir.join("CURRENT.tmp");
        write_and_sync(&current_tmp, format!("{snapshot_name}\n").as_bytes())?;
        fs::rename(&current_tmp, self.dir.join(CURRENT_FILE))?;

        File::open(&self.dir)?.sync_all()?;
        self.wal.truncate()?;

        if old_version > 0 {
            let old_path = self.dir.join(snapshot_file_name(old_version));
            if let Err(error) = fs::remove_file(&old_path) {
                warn!(path = %old_path.display(), %error, "failed to remove old snapshot");
            }
        }

        debug!(version = self.data.version, "manifest checkpoint");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn last_seq(&self) -> u64 {
        self.data.last_seq
    }

    pub fn active_wal(&self) -> u64 {
        self.data.active_wal
    }

    pub fn frozen_wals(&self) -> &[u64] {
        &self.data.frozen_wals
    }

    pub fn segments(&self) -> &[SegmentRecord] {
        &self.data.segments
    }

    pub fn next_segment_id(&self) -> u64 {
        self.data.next_segment_id
    }

    pub fn version(&self) -> u64 {
        self.data.version
    }
}

// ------------------------------------------------------------------------------------------------
// Edit application
// ------------------------------------------------------------------------------------------------

/// Reject edits that would break catalog invariants.
fn validate_edit(data: &ManifestData, edit: &ManifestEdit) -> Result<(), ManifestError> {
    let check_overlap = |added: &[SegmentRecord], removed: &[u64]| -> Result<(), ManifestError> {
        for record in added {
            if record.level == 0 {
                continue;
            }
            if record.min_key > record.max_key {
                return Err(ManifestError::Corruption(format!(
                    "segment {} has inverted key range",
                    record.id
                )));
            }
            let conflict = data
                .segments
                .iter()
                .filter(|s| s.level == record.level && !removed.contains(&s.id))
                .chain(added.iter().filter(|s| s.level == record.level && s.id != record.id))
                .any(|s| s.overlaps(record));
            if conflict {
                return Err(ManifestError::Corruption(format!(
                    "segment {} overlaps a sibling in level {}",
                    record.id, record.level
                )));
            }
        }
        Ok(())
    };

    match edit {
        ManifestEdit::Flush { segment, .. } => check_overlap(std::slice::from_ref(segment), &[]),
        ManifestEdit::Compaction { added, removed } => check_overlap(added, removed),
        _ => Ok(()),
    }
}

/// Fold one edit into the catalog.  Also used during replay, where
/// idempotence matters: counters heal to the maximum seen.
fn apply_edit(data: &mut ManifestData, edit: &ManifestEdit) -> Result<(), ManifestError> {
    match edit {
        ManifestEdit::SetActiveWal { generation } => {
            data.active_wal = *generation;
        }
        ManifestEdit::AddFrozenWal { generation } => {
            if !data.frozen_wals.contains(generation) {
                data.frozen_wals.push(*generation);
            }
        }
        ManifestEdit::Flush {
            segment,
            wal_generation,
        } => {
            data.frozen_wals.retain(|g| g != wal_generation);
            data.segments.retain(|s| s.id != segment.id);
            data.segments.push(segment.clone());
            data.next_segment_id = data.next_segment_id.max(segment.id + 1);
        }
        ManifestEdit::Compaction { added, removed } => {
            data.segments.retain(|s| !removed.contains(&s.id));
            for record in added {
                data.segments.retain(|s| s.id != record.id);
                data.segments.push(record.clone());
                data.next_segment_id = data.next_segment_id.max(record.id + 1);
            }
        }
        ManifestEdit::RemoveFrozenWal { generation } => {
            data.frozen_wals.retain(|g| g != generation);
        }
        ManifestEdit::UpdateSeq { last_seq } => {
            data.last_seq = data.last_seq.max(*last_seq);
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Snapshot I/O
// ------------------------------------------------------------------------------------------------

fn load_snapshot(path: &Path) -> Result<ManifestData, ManifestError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < 4 {
        return Err(ManifestError::Corruption(format!(
            "snapshot {} is only {} bytes",
            path.display(),
            bytes.len()
        )));
    }

    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(ManifestError::Corruption(format!(
            "snapshot {} checksum mismatch (expected {expected:#010x}, got {actual:#010x})",
            path.display()
        )));
    }

    let (data, consumed) = encoding::decode_from_slice::<ManifestData>(payload)?;
    if consumed != payload.len() {
        return Err(ManifestError::Corruption(format!(
            "snapshot {} has {} trailing bytes",
            path.display(),
            payload.len() - consumed
        )));
    }
    Ok(data)
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
