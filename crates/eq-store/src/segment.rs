//! Sealed segment files.
//!
//! A sealed segment is one Parquet file holding a time-ordered block of
//! records. Raw segments live in `raw/segment-NNNNNN.parquet`; compaction and
//! retention rewrite them into `compacted/segment-NNNNNN-gNNNN.parquet`, with
//! the generation bumped on every rewrite. Files are written to a `.tmp`
//! sibling and renamed into place, so a reader never sees a partial file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{WriterProperties, WriterVersion};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::record::Record;
use crate::schema::{batch_to_records, records_to_batch, segment_schema};

pub const RAW_DIR: &str = "raw";
pub const COMPACTED_DIR: &str = "compacted";

const ROW_GROUP_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentTier {
    Raw,
    Compacted,
}

impl std::fmt::Display for SegmentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentTier::Raw => write!(f, "raw"),
            SegmentTier::Compacted => write!(f, "compacted"),
        }
    }
}

/// Catalog entry for one sealed segment, as persisted in `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: u64,
    pub tier: SegmentTier,
    pub generation: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub records: u64,
    /// Ingestion events represented (samples plus failed fetches).
    pub events: u64,
    pub observations: u64,
    pub bytes: u64,
    /// Hex SHA-256 of the file contents.
    pub checksum: String,
    /// Path relative to the data directory.
    pub file: String,
}

/// Relative file name for a segment.
pub fn segment_file_name(tier: SegmentTier, id: u64, generation: u32) -> String {
    match tier {
        SegmentTier::Raw => format!("{}/segment-{:06}.parquet", RAW_DIR, id),
        SegmentTier::Compacted => {
            format!("{}/segment-{:06}-g{:04}.parquet", COMPACTED_DIR, id, generation)
        }
    }
}

/// Parse a segment file name (without directory) back into tier, id and
/// generation. Returns `None` for anything that is not a segment file.
pub fn parse_segment_file_name(name: &str) -> Option<(SegmentTier, u64, u32)> {
    let stem = name.strip_prefix("segment-")?.strip_suffix(".parquet")?;
    match stem.split_once("-g") {
        Some((id, generation)) => Some((
            SegmentTier::Compacted,
            id.parse().ok()?,
            generation.parse().ok()?,
        )),
        None => Some((SegmentTier::Raw, stem.parse().ok()?, 0)),
    }
}

/// A sealed segment on disk.
///
/// Shared as `Arc<SegmentFile>` between the catalog and in-flight readers.
/// Once superseded it is marked obsolete, and the file is removed when the
/// last holder lets go.
#[derive(Debug)]
pub struct SegmentFile {
    meta: SegmentMeta,
    path: PathBuf,
    obsolete: AtomicBool,
}

impl SegmentFile {
    pub fn new(data_dir: &Path, meta: SegmentMeta) -> Self {
        let path = data_dir.join(&meta.file);
        SegmentFile {
            meta,
            path,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.meta.start <= end && self.meta.end >= start
    }

    /// Load every record of the segment.
    pub fn read_records(&self) -> Result<Vec<Record>> {
        read_segment(&self.path)
    }

    /// Schedule the file for deletion once no reader holds it.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed superseded segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove superseded segment"
            ),
        }
    }
}

fn writer_properties() -> Result<WriterProperties> {
    Ok(WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
        .set_max_row_group_size(ROW_GROUP_SIZE)
        .build())
}

/// Write `records` as a new segment and return its catalog entry.
///
/// The records must be non-empty and ordered by start time.
pub fn write_segment(
    data_dir: &Path,
    tier: SegmentTier,
    id: u64,
    generation: u32,
    records: &[Record],
) -> Result<SegmentMeta> {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return Err(StoreError::InvalidPath(format!(
            "refusing to write empty segment {}",
            id
        )));
    };

    let file = segment_file_name(tier, id, generation);
    let final_path = data_dir.join(&file);
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = final_path.with_extension("parquet.tmp");

    let batch = records_to_batch(records)?;
    let handle = File::create(&temp_path)?;
    let mut writer = ArrowWriter::try_new(handle, segment_schema(), Some(writer_properties()?))?;
    writer.write(&batch)?;
    writer.close()?;
    File::open(&temp_path)?.sync_all()?;
    fs::rename(&temp_path, &final_path)?;

    let bytes = fs::metadata(&final_path)?.len();
    let checksum = file_checksum(&final_path)?;
    let end = records.iter().map(Record::end).max().unwrap_or(last.end());

    debug!(
        segment = id,
        %tier,
        generation,
        records = records.len(),
        bytes,
        "segment written"
    );

    Ok(SegmentMeta {
        id,
        tier,
        generation,
        start: first.start(),
        end,
        records: records.len() as u64,
        events: records.iter().map(Record::events).sum(),
        observations: records.iter().map(Record::observations).sum(),
        bytes,
        checksum,
        file,
    })
}

/// Read every record from a segment file.
///
/// Decoding problems are reported as `CorruptSegment` naming the file.
pub fn read_segment(path: &Path) -> Result<Vec<Record>> {
    let name = path.display().to_string();
    let corrupt = |reason: String| {
        StoreError::Engine(eq_common::Error::CorruptSegment {
            path: name.clone(),
            reason,
        })
    };

    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| corrupt(e.to_string()))?
        .build()
        .map_err(|e| corrupt(e.to_string()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| corrupt(e.to_string()))?;
        batch_to_records(&batch, &mut records).map_err(|e| match e {
            StoreError::Engine(eq_common::Error::CorruptSegment { reason, .. }) => corrupt(reason),
            other => other,
        })?;
    }
    Ok(records)
}

/// Hex SHA-256 of a file.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CompactedRun, GapSpan};
    use chrono::{Duration, TimeZone};
    use eq_common::Observation;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
    }

    fn records() -> Vec<Record> {
        vec![
            Record::Sample(Observation::new(t0(), 4)),
            Record::Run(CompactedRun {
                start: t0() + Duration::minutes(1),
                end: t0() + Duration::minutes(9),
                value: 7,
                min: 7,
                max: 7,
                count: 9,
                lane_count: Some(2),
            }),
            Record::Gap(GapSpan {
                start: t0() + Duration::minutes(10),
                end: t0() + Duration::minutes(12),
                count: 3,
            }),
        ]
    }

    #[test]
    fn file_names_roundtrip() {
        assert_eq!(
            segment_file_name(SegmentTier::Raw, 7, 0),
            "raw/segment-000007.parquet"
        );
        assert_eq!(
            segment_file_name(SegmentTier::Compacted, 7, 2),
            "compacted/segment-000007-g0002.parquet"
        );
        assert_eq!(
            parse_segment_file_name("segment-000007.parquet"),
            Some((SegmentTier::Raw, 7, 0))
        );
        assert_eq!(
            parse_segment_file_name("segment-000007-g0002.parquet"),
            Some((SegmentTier::Compacted, 7, 2))
        );
        assert_eq!(parse_segment_file_name("segment-000007.parquet.tmp"), None);
        assert_eq!(parse_segment_file_name("notes.txt"), None);
    }

    #[test]
    fn write_then_read_segment() {
        let dir = tempdir().unwrap();
        let meta = write_segment(dir.path(), SegmentTier::Compacted, 3, 0, &records()).unwrap();

        assert_eq!(meta.records, 3);
        assert_eq!(meta.events, 13);
        assert_eq!(meta.observations, 10);
        assert_eq!(meta.start, t0());
        assert_eq!(meta.end, t0() + Duration::minutes(12));
        assert_eq!(meta.checksum.len(), 64);

        let path = dir.path().join(&meta.file);
        assert!(path.exists());
        assert!(!path.with_extension("parquet.tmp").exists());
        assert_eq!(read_segment(&path).unwrap(), records());
        assert_eq!(file_checksum(&path).unwrap(), meta.checksum);
    }

    #[test]
    fn garbage_file_is_corrupt_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment-000001.parquet");
        fs::write(&path, b"definitely not parquet").unwrap();

        let err = read_segment(&path).unwrap_err();
        assert_eq!(err.code(), 20);
        assert!(err.to_string().contains("segment-000001"));
    }

    #[test]
    fn obsolete_file_removed_on_last_drop() {
        let dir = tempdir().unwrap();
        let meta = write_segment(dir.path(), SegmentTier::Raw, 1, 0, &records()).unwrap();
        let segment = Arc::new(SegmentFile::new(dir.path(), meta));
        let reader = Arc::clone(&segment);
        let path = segment.path().to_path_buf();

        segment.mark_obsolete();
        drop(segment);
        assert!(path.exists(), "reader still holds the segment");
        assert_eq!(reader.read_records().unwrap().len(), 3);

        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn empty_segment_is_refused() {
        let dir = tempdir().unwrap();
        assert!(write_segment(dir.path(), SegmentTier::Raw, 1, 0, &[]).is_err());
    }
}
