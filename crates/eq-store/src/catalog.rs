//! Segment catalog and `meta.json`.
//!
//! The catalog is an immutable, time-ordered list of sealed segments. The
//! store swaps whole catalogs (copy-on-write) so readers can hold one without
//! blocking the writer.
//!
//! At startup the catalog comes from `meta.json` when that file agrees with
//! the directory contents, and from a full directory re-scan otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eq_common::SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::Ledger;
use crate::record::Record;
use crate::segment::{
    file_checksum, parse_segment_file_name, read_segment, segment_file_name, SegmentFile,
    SegmentMeta, SegmentTier, COMPACTED_DIR, RAW_DIR,
};

pub const META_FILE: &str = "meta.json";

/// Persisted store metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub version: String,
    pub next_segment_id: u64,
    /// End of the newest segment ever sealed. Log entries at or before it
    /// were already sealed.
    pub last_sealed_end: Option<DateTime<Utc>>,
    /// Last entry accepted into storage, for duplicate checks after restart.
    pub last_entry: Option<Record>,
    pub segments: Vec<SegmentMeta>,
    pub ledger: Ledger,
    pub updated_at: DateTime<Utc>,
}

/// Immutable, start-ordered set of sealed segments.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    segments: Vec<Arc<SegmentFile>>,
}

impl Catalog {
    pub fn new(mut segments: Vec<Arc<SegmentFile>>) -> Self {
        segments.sort_by_key(|s| (s.meta().start, s.id()));
        Catalog { segments }
    }

    pub fn segments(&self) -> &[Arc<SegmentFile>] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Arc<SegmentFile>> {
        self.segments.iter().find(|s| s.id() == id)
    }

    /// Segments intersecting `[start, end]`, in time order.
    pub fn overlapping(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Arc<SegmentFile>> {
        self.segments
            .iter()
            .filter(|s| s.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// The newest segment ending strictly before `at`.
    pub fn last_before(&self, at: DateTime<Utc>) -> Option<&Arc<SegmentFile>> {
        self.segments.iter().rev().find(|s| s.meta().end < at)
    }

    pub fn last(&self) -> Option<&Arc<SegmentFile>> {
        self.segments.iter().max_by_key(|s| s.meta().end)
    }

    /// A new catalog with `added` included.
    pub fn with_segment(&self, added: Arc<SegmentFile>) -> Catalog {
        let mut segments = self.segments.clone();
        segments.push(added);
        Catalog::new(segments)
    }

    /// A new catalog with segment `id` replaced by `replacement`, or removed
    /// when `replacement` is `None`.
    pub fn with_replaced(&self, id: u64, replacement: Option<Arc<SegmentFile>>) -> Catalog {
        let mut segments: Vec<_> = self
            .segments
            .iter()
            .filter(|s| s.id() != id)
            .cloned()
            .collect();
        segments.extend(replacement);
        Catalog::new(segments)
    }

    pub fn metas(&self) -> Vec<SegmentMeta> {
        self.segments.iter().map(|s| s.meta().clone()).collect()
    }

    /// Ledger contribution of the sealed tiers.
    pub fn ledger(&self) -> Ledger {
        let mut ledger = Ledger::default();
        for segment in &self.segments {
            ledger.add_segment(segment.meta());
        }
        ledger
    }
}

pub fn meta_path(data_dir: &Path) -> PathBuf {
    data_dir.join(META_FILE)
}

/// Load `meta.json`. Missing, unreadable or wrong-version metadata yields
/// `None` so the caller can fall back to a re-scan.
pub fn load_meta(data_dir: &Path) -> Option<StoreMeta> {
    let path = meta_path(data_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "metadata unreadable");
            return None;
        }
    };
    match serde_json::from_str::<StoreMeta>(&content) {
        Ok(meta) if meta.version == SCHEMA_VERSION => Some(meta),
        Ok(meta) => {
            warn!(found = %meta.version, expected = SCHEMA_VERSION, "metadata version mismatch");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "metadata unparsable");
            None
        }
    }
}

/// Write `meta.json` atomically and return its size in bytes.
pub fn write_meta(data_dir: &Path, meta: &StoreMeta) -> Result<u64> {
    let path = meta_path(data_dir);
    let temp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(meta)?;
    fs::write(&temp, &body)?;
    fs::File::open(&temp)?.sync_all()?;
    fs::rename(&temp, &path)?;
    Ok(body.len() as u64)
}

/// How the catalog was obtained at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSource {
    Metadata,
    Rescan,
}

/// A segment file set aside because it could not be read.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedSegment {
    pub file: String,
    pub reason: String,
}

/// Outcome of loading the catalog from disk.
#[derive(Debug)]
pub struct LoadedCatalog {
    pub catalog: Catalog,
    pub source: CatalogSource,
    pub next_segment_id: u64,
    pub last_sealed_end: Option<DateTime<Utc>>,
    pub last_entry: Option<Record>,
    /// Lifetime counters carried over from the metadata snapshot.
    pub carried: Option<Ledger>,
    pub quarantined: Vec<QuarantinedSegment>,
    pub superseded_removed: Vec<String>,
    pub stale_temp_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FileKey {
    tier_rank: u8,
    generation: u32,
}

/// One segment file found on disk.
#[derive(Debug, Clone)]
struct Found {
    id: u64,
    tier: SegmentTier,
    generation: u32,
    relative: String,
}

fn list_segment_files(data_dir: &Path, stale_temp: &mut usize) -> Result<Vec<Found>> {
    let mut found = Vec::new();
    for sub in [RAW_DIR, COMPACTED_DIR] {
        let dir = data_dir.join(sub);
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                fs::remove_file(entry.path())?;
                *stale_temp += 1;
                continue;
            }
            if let Some((tier, id, generation)) = parse_segment_file_name(&name) {
                found.push(Found {
                    id,
                    tier,
                    generation,
                    relative: format!("{}/{}", sub, name),
                });
            }
        }
    }
    Ok(found)
}

fn metadata_matches_disk(data_dir: &Path, meta: &StoreMeta, on_disk: &[Found]) -> bool {
    let listed: BTreeSet<&str> = meta.segments.iter().map(|s| s.file.as_str()).collect();
    let present: BTreeSet<&str> = on_disk.iter().map(|f| f.relative.as_str()).collect();
    if listed != present {
        return false;
    }
    meta.segments.iter().all(|s| {
        fs::metadata(data_dir.join(&s.file))
            .map(|m| m.len() == s.bytes)
            .unwrap_or(false)
    })
}

/// Build the catalog from disk.
pub fn load_catalog(data_dir: &Path) -> Result<LoadedCatalog> {
    let mut stale_temp_removed = 0;
    let meta_temp = meta_path(data_dir).with_extension("json.tmp");
    if meta_temp.exists() {
        fs::remove_file(&meta_temp)?;
        stale_temp_removed += 1;
    }
    let on_disk = list_segment_files(data_dir, &mut stale_temp_removed)?;

    if let Some(meta) = load_meta(data_dir) {
        if metadata_matches_disk(data_dir, &meta, &on_disk) {
            let segments = meta
                .segments
                .iter()
                .cloned()
                .map(|m| Arc::new(SegmentFile::new(data_dir, m)))
                .collect();
            debug!(segments = meta.segments.len(), "catalog loaded from metadata");
            return Ok(LoadedCatalog {
                catalog: Catalog::new(segments),
                source: CatalogSource::Metadata,
                next_segment_id: meta.next_segment_id,
                last_sealed_end: meta.last_sealed_end,
                last_entry: meta.last_entry,
                carried: Some(meta.ledger),
                quarantined: Vec::new(),
                superseded_removed: Vec::new(),
                stale_temp_removed,
            });
        }
        warn!("metadata does not match segment files; re-scanning data directory");
    } else if !on_disk.is_empty() {
        warn!("metadata missing or invalid; re-scanning data directory");
    }

    rescan(data_dir, on_disk, stale_temp_removed)
}

fn rescan(data_dir: &Path, on_disk: Vec<Found>, stale_temp_removed: usize) -> Result<LoadedCatalog> {
    let next_segment_id = on_disk.iter().map(|f| f.id + 1).max().unwrap_or(0);

    // Per id, the compacted tier beats raw and a higher generation beats a
    // lower one.
    let mut by_id: BTreeMap<u64, Vec<Found>> = BTreeMap::new();
    for found in on_disk {
        by_id.entry(found.id).or_default().push(found);
    }

    let mut segments = Vec::new();
    let mut quarantined = Vec::new();
    let mut superseded_removed = Vec::new();
    let mut last_entry: Option<Record> = None;

    for (_, mut candidates) in by_id {
        candidates.sort_by_key(|f| FileKey {
            tier_rank: match f.tier {
                SegmentTier::Raw => 0,
                SegmentTier::Compacted => 1,
            },
            generation: f.generation,
        });

        // Try the best candidate first; fall back if it is unreadable.
        let mut chosen = None;
        while let Some(found) = candidates.pop() {
            let path = data_dir.join(&found.relative);
            match read_segment(&path) {
                Ok(records) if !records.is_empty() => {
                    chosen = Some((found, records));
                    break;
                }
                Ok(_) => quarantine(&path, &found.relative, "segment is empty".into(), &mut quarantined),
                Err(e) => quarantine(&path, &found.relative, e.to_string(), &mut quarantined),
            }
        }
        for loser in candidates {
            fs::remove_file(data_dir.join(&loser.relative))?;
            info!(file = %loser.relative, "removed superseded segment file");
            superseded_removed.push(loser.relative);
        }

        let Some((found, records)) = chosen else {
            continue;
        };
        let path = data_dir.join(&found.relative);
        let meta = SegmentMeta {
            id: found.id,
            tier: found.tier,
            generation: found.generation,
            start: records.first().map(Record::start).unwrap_or_default(),
            end: records.iter().map(Record::end).max().unwrap_or_default(),
            records: records.len() as u64,
            events: records.iter().map(Record::events).sum(),
            observations: records.iter().map(Record::observations).sum(),
            bytes: fs::metadata(&path)?.len(),
            checksum: file_checksum(&path)?,
            file: segment_file_name(found.tier, found.id, found.generation),
        };
        if let Some(last) = records.last() {
            if last_entry.map_or(true, |prev| last.end() > prev.end()) {
                last_entry = Some(*last);
            }
        }
        segments.push(Arc::new(SegmentFile::new(data_dir, meta)));
    }

    let catalog = Catalog::new(segments);
    let last_sealed_end = catalog.last().map(|s| s.meta().end);
    info!(
        segments = catalog.len(),
        quarantined = quarantined.len(),
        superseded = superseded_removed.len(),
        "catalog rebuilt from directory scan"
    );

    Ok(LoadedCatalog {
        catalog,
        source: CatalogSource::Rescan,
        next_segment_id,
        last_sealed_end,
        last_entry,
        carried: None,
        quarantined,
        superseded_removed,
        stale_temp_removed,
    })
}

fn quarantine(path: &Path, relative: &str, reason: String, out: &mut Vec<QuarantinedSegment>) {
    let target = path.with_extension("parquet.corrupt");
    match fs::rename(path, &target) {
        Ok(()) => warn!(file = %relative, %reason, "quarantined corrupt segment"),
        Err(e) => warn!(file = %relative, %reason, error = %e, "failed to quarantine corrupt segment"),
    }
    out.push(QuarantinedSegment {
        file: relative.to_string(),
        reason,
    });
}
