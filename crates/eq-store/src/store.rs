//! The queue store: ingestion, sealing, compaction hand-off, queries,
//! accounting and retention over one data directory.
//!
//! # Concurrency
//!
//! - `writer` is the single mutation path. Appends, seals, catalog swaps,
//!   retention and every ledger update run under it.
//! - `compaction` keeps two compactions (background or retention) from
//!   rewriting the same segment at once. It is always taken before `writer`.
//! - `catalog` is replaced wholesale; readers clone the `Arc` and never wait
//!   on file IO.
//! - `open` mirrors the open log. A seal swaps the catalog and clears `open`
//!   while holding `open` for writing, so a reader sees the entries either in
//!   the buffer or in a sealed segment, never both.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use eq_common::{
    validate, Aggregation, Candidate, Disposition, IngestPolicy, RawObservation, Resolution,
    SCHEMA_VERSION,
};
use eq_config::EngineConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{
    load_catalog, meta_path, write_meta, Catalog, CatalogSource, QuarantinedSegment, StoreMeta,
};
use crate::compactor::{compact, CompactionConfig};
use crate::error::{Result, StoreError};
use crate::ledger::{Footprint, Ledger, LedgerMismatch};
use crate::log::{read_log, OpenLog, TailDefect};
use crate::query::series::bucket_count;
use crate::query::{
    activity, check_range, wait, ActivitySummary, QueryOptions, RangeReader, SeriesIter,
    ThroughputModel, WaitSummary,
};
use crate::record::Record;
use crate::retention::{
    downsample, estimate_bytes, evict, persist_events, RetentionAction, RetentionEvent,
    RetentionPolicy, RetentionReport,
};
use crate::segment::{
    file_checksum, parse_segment_file_name, write_segment, SegmentFile, SegmentMeta, SegmentTier,
    COMPACTED_DIR, RAW_DIR,
};
use crate::worker::CompactionWorker;

pub const LOG_FILE: &str = "open.log";

/// Upper bound on buckets per series query.
pub const MAX_SERIES_BUCKETS: u64 = 100_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Result of one accepted (or merged) ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Committed {
        timestamp: DateTime<Utc>,
    },
    /// Same reading at the same instant as the last entry; nothing stored.
    Merged {
        timestamp: DateTime<Utc>,
    },
    /// A failed fetch recorded as "no data".
    GapRecorded {
        timestamp: DateTime<Utc>,
    },
    /// Accepted after moving a slightly-behind timestamp forward.
    Clamped {
        timestamp: DateTime<Utc>,
        original: DateTime<Utc>,
    },
}

impl AppendOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            AppendOutcome::Committed { .. } => "committed",
            AppendOutcome::Merged { .. } => "merged",
            AppendOutcome::GapRecorded { .. } => "gap_recorded",
            AppendOutcome::Clamped { .. } => "clamped",
        }
    }
}

/// What `open` found and repaired.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub catalog_source: CatalogSource,
    pub segments: usize,
    pub quarantined: Vec<QuarantinedSegment>,
    pub superseded_removed: Vec<String>,
    pub stale_temp_removed: usize,
    /// Complete open-log entries restored into the open segment.
    pub open_entries: usize,
    /// Open-log entries dropped because a sealed segment already holds them.
    pub skipped_sealed_entries: usize,
    pub log_defect: Option<TailDefect>,
    pub log_discarded_bytes: u64,
}

impl RecoveryReport {
    /// True when nothing had to be repaired or set aside.
    pub fn is_clean(&self) -> bool {
        self.quarantined.is_empty()
            && self.superseded_removed.is_empty()
            && self.skipped_sealed_entries == 0
            && self.log_defect.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionSummary {
    pub segments: usize,
    pub records_before: u64,
    pub records_after: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyProblem {
    pub file: String,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub segments_checked: usize,
    pub problems: Vec<VerifyProblem>,
    pub mismatches: Vec<LedgerMismatch>,
    pub tracked: Footprint,
    pub scanned: Footprint,
}

struct WriterState {
    log: OpenLog,
    ledger: Ledger,
    next_segment_id: u64,
    last_sealed_end: Option<DateTime<Utc>>,
    last_entry: Option<Record>,
}

pub(crate) struct StoreInner {
    dir: PathBuf,
    config: EngineConfig,
    ingest_policy: IngestPolicy,
    compaction_config: CompactionConfig,
    writer: Mutex<WriterState>,
    compaction: Mutex<()>,
    catalog: RwLock<Arc<Catalog>>,
    open: RwLock<Vec<Record>>,
    handoff: Mutex<Option<mpsc::Sender<u64>>>,
}

/// Storage and statistics engine for one queue.
pub struct QueueStore {
    inner: Arc<StoreInner>,
    worker: Option<CompactionWorker>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("dir", &self.inner.dir)
            .field("segments", &self.inner.catalog_snapshot().len())
            .field("background_compaction", &self.worker.is_some())
            .finish()
    }
}

impl QueueStore {
    /// Open (or create) a store, recovering whatever state is on disk.
    pub fn open(data_dir: impl AsRef<Path>, config: &EngineConfig) -> Result<(Self, RecoveryReport)> {
        let dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        if !dir.is_dir() {
            return Err(StoreError::InvalidPath(dir.display().to_string()));
        }

        let loaded = load_catalog(&dir)?;
        let (mut log, scan) = OpenLog::open(&dir.join(LOG_FILE))?;

        let boundary = loaded.last_sealed_end;
        let total_entries = scan.entries.len();
        let kept: Vec<Candidate> = scan
            .entries
            .iter()
            .copied()
            .filter(|entry| boundary.map_or(true, |b| entry.timestamp() > b))
            .collect();
        let skipped = total_entries - kept.len();
        if skipped > 0 {
            warn!(skipped, "open log holds entries that were already sealed; rewriting it");
            log.rewrite(&kept)?;
        }

        let open_records: Vec<Record> = kept.iter().copied().map(Record::from).collect();
        let mut ledger = loaded.catalog.ledger();
        ledger.open_bytes = log.len();
        ledger.open_records = open_records.len() as u64;
        ledger.events += open_records.len() as u64;
        ledger.observations += open_records.iter().map(Record::observations).sum::<u64>();
        match &loaded.carried {
            Some(carried) => {
                // The snapshot already counted the open entries it saw.
                ledger.appended_total = carried.appended_total.saturating_sub(carried.open_records)
                    + open_records.len() as u64;
                ledger.merged_duplicates = carried.merged_duplicates;
                ledger.evicted_events = carried.evicted_events;
            }
            None => ledger.appended_total = ledger.events,
        }

        let last_entry = open_records.last().copied().or(loaded.last_entry);
        let source = loaded.source;
        let report = RecoveryReport {
            catalog_source: loaded.source,
            segments: loaded.catalog.len(),
            quarantined: loaded.quarantined,
            superseded_removed: loaded.superseded_removed,
            stale_temp_removed: loaded.stale_temp_removed,
            open_entries: open_records.len(),
            skipped_sealed_entries: skipped,
            log_defect: scan.defect,
            log_discarded_bytes: scan.discarded_bytes(),
        };

        let raw_ids: Vec<u64> = loaded
            .catalog
            .segments()
            .iter()
            .filter(|s| s.meta().tier == SegmentTier::Raw)
            .map(|s| s.id())
            .collect();

        let inner = Arc::new(StoreInner {
            ingest_policy: config.ingest_policy(),
            compaction_config: CompactionConfig::from_engine(config),
            config: config.clone(),
            writer: Mutex::new(WriterState {
                log,
                ledger,
                next_segment_id: loaded.next_segment_id,
                last_sealed_end: loaded.last_sealed_end,
                last_entry,
            }),
            compaction: Mutex::new(()),
            catalog: RwLock::new(Arc::new(loaded.catalog)),
            open: RwLock::new(open_records),
            handoff: Mutex::new(None),
            dir,
        });
        // Intact metadata needs no rewrite, so read-only opens leave the
        // directory untouched.
        {
            let mut state = lock(&inner.writer);
            if source == CatalogSource::Metadata && report.is_clean() && report.stale_temp_removed == 0 {
                state.ledger.index_bytes = fs::metadata(meta_path(&inner.dir))?.len();
            } else {
                inner.persist_meta(&mut state)?;
            }
        }

        let worker = if config.compaction.auto_compact {
            let (tx, rx) = mpsc::channel();
            for id in &raw_ids {
                // The receiver is alive until the worker stops.
                let _ = tx.send(*id);
            }
            *lock(&inner.handoff) = Some(tx);
            Some(CompactionWorker::start(Arc::clone(&inner), rx)?)
        } else {
            None
        };

        info!(
            dir = %inner.dir.display(),
            source = ?report.catalog_source,
            segments = report.segments,
            open_entries = report.open_entries,
            quarantined = report.quarantined.len(),
            log_discarded_bytes = report.log_discarded_bytes,
            "queue store opened"
        );
        Ok((QueueStore { inner, worker }, report))
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate and durably append one observation or gap marker.
    pub fn append(&self, raw: &RawObservation) -> Result<AppendOutcome> {
        let (outcome, sealed) = self.inner.append(raw)?;
        if let Some(id) = sealed {
            self.inner.hand_off(id);
        }
        Ok(outcome)
    }

    /// Seal the open segment now, whatever its size. Returns the new segment
    /// id, or `None` when the open segment is empty.
    pub fn force_seal(&self) -> Result<Option<u64>> {
        let sealed = {
            let mut state = lock(&self.inner.writer);
            self.inner.seal_locked(&mut state)?
        };
        if let Some(id) = sealed {
            self.inner.hand_off(id);
        }
        Ok(sealed)
    }

    /// Compact one sealed raw segment. `None` when it is gone or already
    /// compacted.
    pub fn compact_segment(&self, id: u64) -> Result<Option<SegmentMeta>> {
        self.inner.compact_segment(id)
    }

    /// Compact every raw segment in the catalog.
    pub fn compact_pending(&self) -> Result<CompactionSummary> {
        let raw: Vec<Arc<SegmentFile>> = self
            .inner
            .catalog_snapshot()
            .segments()
            .iter()
            .filter(|s| s.meta().tier == SegmentTier::Raw)
            .cloned()
            .collect();

        let mut summary = CompactionSummary::default();
        for segment in raw {
            if let Some(meta) = self.inner.compact_segment(segment.id())? {
                summary.segments += 1;
                summary.records_before += segment.meta().records;
                summary.bytes_before += segment.meta().bytes;
                summary.records_after += meta.records;
                summary.bytes_after += meta.bytes;
            }
        }
        Ok(summary)
    }

    /// Lazy, time-ordered records intersecting `[start, end]`.
    pub fn read_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: QueryOptions,
    ) -> Result<RangeReader> {
        check_range(start, end)?;
        Ok(self.inner.reader(start, end, false, options))
    }

    /// Bucketed series over `[start, end]`.
    pub fn series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
        aggregation: Aggregation,
        options: QueryOptions,
    ) -> Result<SeriesIter> {
        check_range(start, end)?;
        let buckets = bucket_count(start, end, resolution);
        if buckets > MAX_SERIES_BUCKETS {
            return Err(eq_common::Error::InvalidResolution(format!(
                "{} over this range gives {} buckets (limit {})",
                resolution, buckets, MAX_SERIES_BUCKETS
            ))
            .into());
        }
        let reader = self.inner.reader(start, end, true, options);
        Ok(SeriesIter::new(reader, resolution, aggregation))
    }

    /// Waiting-time distribution over `[start, end]` under `model`.
    pub fn estimate_wait(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        model: &dyn ThroughputModel,
        options: QueryOptions,
    ) -> Result<WaitSummary> {
        check_range(start, end)?;
        wait::estimate(self.inner.reader(start, end, false, options), model)
    }

    pub fn activity_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: QueryOptions,
    ) -> Result<ActivitySummary> {
        check_range(start, end)?;
        activity::summarize(self.inner.reader(start, end, false, options))
    }

    /// Time covered by stored data, if any.
    pub fn time_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let open = read(&self.inner.open);
        let catalog = self.inner.catalog_snapshot();
        let first = catalog
            .segments()
            .first()
            .map(|s| s.meta().start)
            .or_else(|| open.first().map(Record::start))?;
        let last = open
            .last()
            .map(Record::end)
            .or_else(|| catalog.last().map(|s| s.meta().end))?;
        Some((first, last))
    }

    pub fn footprint(&self) -> Footprint {
        Footprint::from(&lock(&self.inner.writer).ledger)
    }

    /// Footprint including the per-segment listing.
    pub fn footprint_detailed(&self) -> Footprint {
        let mut footprint = self.footprint();
        footprint.segments = Some(self.inner.catalog_snapshot().metas());
        footprint
    }

    /// Recompute the ledger from a full scan and compare.
    pub fn verify(&self) -> Result<VerifyReport> {
        self.inner.verify()
    }

    /// Apply `policy` as of `now`.
    pub fn enforce_retention(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionReport> {
        self.inner.run_retention(policy, now, false)
    }

    /// Report what `enforce_retention` would do without changing anything.
    pub fn preview_retention(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionReport> {
        self.inner.run_retention(policy, now, true)
    }
}

impl Drop for QueueStore {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain queued jobs and exit.
        lock(&self.inner.handoff).take();
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl StoreInner {
    fn catalog_snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&read(&self.catalog))
    }

    fn persist_meta(&self, state: &mut WriterState) -> Result<()> {
        let meta = StoreMeta {
            version: SCHEMA_VERSION.to_string(),
            next_segment_id: state.next_segment_id,
            last_sealed_end: state.last_sealed_end,
            last_entry: state.last_entry,
            segments: self.catalog_snapshot().metas(),
            ledger: state.ledger.clone(),
            updated_at: Utc::now(),
        };
        state.ledger.index_bytes = write_meta(&self.dir, &meta)?;
        Ok(())
    }

    fn hand_off(&self, id: u64) {
        if let Some(tx) = lock(&self.handoff).as_ref() {
            if tx.send(id).is_err() {
                debug!(segment = id, "compaction worker gone; segment stays raw");
            }
        }
    }

    fn append(&self, raw: &RawObservation) -> Result<(AppendOutcome, Option<u64>)> {
        let mut state = lock(&self.writer);
        let last = state.last_entry.map(|r| r.end());
        let validated = validate(raw, last, &self.ingest_policy)?;

        match validated.disposition {
            Disposition::Duplicate => {
                let existing = state.last_entry.ok_or_else(|| {
                    StoreError::from(eq_common::Error::InvalidObservation(
                        "duplicate reported without a previous entry".to_string(),
                    ))
                })?;
                let timestamp = validated.candidate.timestamp();
                return self
                    .merge_duplicate(&mut state, validated.candidate, existing, timestamp)
                    .map(|o| (o, None));
            }
            // A replay of an entry already stored just behind the last one is
            // a duplicate, not a late arrival.
            Disposition::Clamped { original } => {
                if let Some(existing) = self.stored_at(original)? {
                    return self
                        .merge_duplicate(&mut state, validated.candidate, existing, original)
                        .map(|o| (o, None));
                }
            }
            Disposition::Fresh => {}
        }

        let candidate = validated.candidate;
        let record = Record::from(candidate);
        let frame = state.log.append(&candidate)?;
        write(&self.open).push(record);
        state.ledger.record_append(frame, record.observations());
        state.last_entry = Some(record);

        let timestamp = candidate.timestamp();
        let outcome = match (candidate, validated.disposition) {
            (Candidate::Gap(_), _) => AppendOutcome::GapRecorded { timestamp },
            (_, Disposition::Clamped { original }) => {
                warn!(
                    original = %original.to_rfc3339(),
                    clamped = %timestamp.to_rfc3339(),
                    "observation behind last entry; timestamp clamped"
                );
                AppendOutcome::Clamped { timestamp, original }
            }
            _ => AppendOutcome::Committed { timestamp },
        };
        debug!(outcome = outcome.name(), ts = %timestamp.to_rfc3339(), "appended");

        let sealed = if self.seal_due(&state) {
            self.seal_locked(&mut state)?
        } else {
            None
        };
        Ok((outcome, sealed))
    }

    /// A stored sample, run edge or gap sitting at `at` (within the duplicate
    /// tolerance). Looks through the open buffer, then the newest sealed
    /// segments. Caller holds `writer`.
    fn stored_at(&self, at: DateTime<Utc>) -> Result<Option<Record>> {
        let tolerance = self.ingest_policy.duplicate_tolerance;
        let floor = at - tolerance;
        let hits = |record: &Record| {
            !matches!(record, Record::Rollup(_))
                && ((record.start() - at).abs() <= tolerance || (record.end() - at).abs() <= tolerance)
        };

        {
            let open = read(&self.open);
            for record in open.iter().rev() {
                if record.end() < floor {
                    return Ok(None);
                }
                if hits(record) {
                    return Ok(Some(*record));
                }
            }
        }

        let catalog = self.catalog_snapshot();
        for segment in catalog.segments().iter().rev() {
            if segment.meta().end < floor {
                break;
            }
            if let Some(record) = segment.read_records()?.into_iter().rev().find(|r| hits(r)) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn merge_duplicate(
        &self,
        state: &mut WriterState,
        incoming: Candidate,
        existing: Record,
        timestamp: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let same = match (incoming, existing) {
            (Candidate::Sample(obs), Record::Sample(prev)) => prev.same_reading(&obs),
            (Candidate::Sample(obs), Record::Run(run)) => {
                run.min == run.max && run.value == obs.queue_length && run.lane_count == obs.lane_count
            }
            (Candidate::Sample(obs), Record::Rollup(r)) => {
                r.samples > 0 && r.min == r.max && r.min == obs.queue_length
            }
            (Candidate::Gap(_), Record::Gap(_)) => true,
            (Candidate::Gap(_), Record::Rollup(r)) => r.is_gap_only(),
            _ => false,
        };
        if !same {
            return Err(eq_common::Error::AmbiguousDuplicate {
                timestamp,
                existing: existing.describe(),
                incoming: incoming.describe(),
            }
            .into());
        }
        state.ledger.merged_duplicates += 1;
        debug!(ts = %timestamp.to_rfc3339(), "duplicate merged");
        Ok(AppendOutcome::Merged { timestamp })
    }

    fn seal_due(&self, state: &WriterState) -> bool {
        let limits = &self.config.segment;
        if state.ledger.open_records as usize >= limits.max_records
            || state.ledger.open_bytes >= limits.max_bytes
        {
            return true;
        }
        let open = read(&self.open);
        match (open.first(), open.last()) {
            (Some(first), Some(last)) => {
                (last.end() - first.start()).num_seconds() >= limits.max_duration_secs as i64
            }
            _ => false,
        }
    }

    /// Seal the open buffer into a raw segment. Caller holds `writer`.
    fn seal_locked(&self, state: &mut WriterState) -> Result<Option<u64>> {
        let records: Vec<Record> = read(&self.open).clone();
        if records.is_empty() {
            return Ok(None);
        }

        let id = state.next_segment_id;
        let meta = write_segment(&self.dir, SegmentTier::Raw, id, 0, &records)?;
        state.next_segment_id += 1;

        {
            let mut open = write(&self.open);
            let next = self
                .catalog_snapshot()
                .with_segment(Arc::new(SegmentFile::new(&self.dir, meta.clone())));
            *write(&self.catalog) = Arc::new(next);
            open.clear();
        }

        let events: u64 = records.iter().map(Record::events).sum();
        let observations: u64 = records.iter().map(Record::observations).sum();
        state.ledger.clear_open(events, observations);
        state.ledger.add_segment(&meta);
        state.last_sealed_end = Some(meta.end);
        self.persist_meta(state)?;
        state.log.reset()?;

        info!(
            segment = id,
            records = meta.records,
            bytes = meta.bytes,
            start = %meta.start.to_rfc3339(),
            end = %meta.end.to_rfc3339(),
            "open segment sealed"
        );
        Ok(Some(id))
    }

    /// Replace `old` in the catalog with `replacement` (or drop it) and
    /// update the ledger.
    fn swap_segment(&self, old: &Arc<SegmentFile>, replacement: Option<SegmentMeta>) -> Result<()> {
        let mut state = lock(&self.writer);
        let new_file = replacement
            .as_ref()
            .map(|m| Arc::new(SegmentFile::new(&self.dir, m.clone())));
        let next = self.catalog_snapshot().with_replaced(old.id(), new_file);
        *write(&self.catalog) = Arc::new(next);

        state.ledger.remove_segment(old.meta());
        if let Some(meta) = &replacement {
            state.ledger.add_segment(meta);
        }
        self.persist_meta(&mut state)?;
        old.mark_obsolete();
        Ok(())
    }

    pub(crate) fn compact_segment(&self, id: u64) -> Result<Option<SegmentMeta>> {
        let _guard = lock(&self.compaction);
        let Some(segment) = self.catalog_snapshot().get(id).cloned() else {
            return Ok(None);
        };
        if segment.meta().tier != SegmentTier::Raw {
            return Ok(None);
        }

        let records = segment.read_records()?;
        let compacted = compact(&records, &self.compaction_config);
        let meta = write_segment(&self.dir, SegmentTier::Compacted, id, 0, &compacted)?;
        self.swap_segment(&segment, Some(meta.clone()))?;

        info!(
            segment = id,
            records_before = records.len(),
            records_after = compacted.len(),
            bytes_before = segment.meta().bytes,
            bytes_after = meta.bytes,
            "segment compacted"
        );
        Ok(Some(meta))
    }

    fn reader(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback: bool,
        options: QueryOptions,
    ) -> RangeReader {
        // Take the open buffer first: a concurrent seal cannot move entries
        // into the catalog until this guard is released.
        let open = read(&self.open);
        let catalog = self.catalog_snapshot();
        let first = open.partition_point(|r| r.end() < start);
        let first = if lookback { first.saturating_sub(1) } else { first };
        let last = open.partition_point(|r| r.start() <= end);
        let snapshot = open.get(first..last.max(first)).unwrap_or_default().to_vec();
        drop(open);

        let mut segments = catalog.overlapping(start, end);
        if lookback {
            if let Some(previous) = catalog.last_before(start) {
                if !segments.iter().any(|s| s.id() == previous.id()) {
                    segments.insert(0, Arc::clone(previous));
                }
            }
        }
        RangeReader::new(start, end, segments, snapshot, options)
    }

    fn verify(&self) -> Result<VerifyReport> {
        let state = lock(&self.writer);
        let catalog = self.catalog_snapshot();
        let mut scanned = Ledger::default();
        let mut problems = Vec::new();

        for segment in catalog.segments() {
            let meta = segment.meta();
            let mut problem = |text: String| {
                problems.push(VerifyProblem {
                    file: meta.file.clone(),
                    problem: text,
                })
            };
            let bytes = match fs::metadata(segment.path()) {
                Ok(m) => m.len(),
                Err(e) => {
                    problem(format!("unreadable: {}", e));
                    continue;
                }
            };
            match file_checksum(segment.path()) {
                Ok(sum) if sum == meta.checksum => {}
                Ok(sum) => problem(format!("checksum {} differs from recorded {}", sum, meta.checksum)),
                Err(e) => problem(format!("checksum failed: {}", e)),
            }
            let records = match segment.read_records() {
                Ok(records) => records,
                Err(e) => {
                    problem(e.to_string());
                    continue;
                }
            };
            scanned.add_segment(&SegmentMeta {
                bytes,
                records: records.len() as u64,
                events: records.iter().map(Record::events).sum(),
                observations: records.iter().map(Record::observations).sum(),
                ..meta.clone()
            });
        }

        for sub in [RAW_DIR, COMPACTED_DIR] {
            let dir = self.dir.join(sub);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some((_, id, _)) = parse_segment_file_name(&name) {
                    // A listed id under another name is a superseded file
                    // still held by a reader.
                    if catalog.get(id).is_none() {
                        let relative = format!("{}/{}", sub, name);
                        problems.push(VerifyProblem {
                            file: relative,
                            problem: "segment file not in catalog".to_string(),
                        });
                    }
                }
            }
        }

        let log = read_log(state.log.path())?;
        scanned.open_bytes = log.valid_len;
        scanned.open_records = log.entries.len() as u64;
        scanned.events += log.entries.len() as u64;
        scanned.observations += log
            .entries
            .iter()
            .filter(|e| matches!(e, Candidate::Sample(_)))
            .count() as u64;
        scanned.index_bytes = state.ledger.index_bytes;

        let mismatches = state.ledger.diff(&scanned);
        let report = VerifyReport {
            ok: problems.is_empty() && mismatches.is_empty(),
            segments_checked: catalog.len(),
            problems,
            mismatches,
            tracked: Footprint::from(&state.ledger),
            scanned: Footprint::from(&scanned),
        };
        if report.ok {
            info!(segments = report.segments_checked, "verify passed");
        } else {
            warn!(
                problems = report.problems.len(),
                mismatches = report.mismatches.len(),
                "verify found inconsistencies"
            );
        }
        Ok(report)
    }

    fn run_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<RetentionReport> {
        let _guard = lock(&self.compaction);
        let footprint_before = Footprint::from(&lock(&self.writer).ledger);
        let raw_cutoff = now - policy.raw_horizon;
        let mut events = Vec::new();
        let mut items: Vec<WorkItem> = Vec::new();

        // 1. Force-seal an open segment whose data aged past the horizon.
        let mut sealed = None;
        {
            let mut state = lock(&self.writer);
            let open: Vec<Record> = read(&self.open).clone();
            if let (Some(first), Some(last)) = (open.first(), open.last()) {
                if first.start() < raw_cutoff {
                    let mut event = RetentionEvent {
                        timestamp: now,
                        action: RetentionAction::ForceSeal,
                        segment: state.next_segment_id,
                        range_start: first.start(),
                        range_end: last.end(),
                        bytes_before: state.ledger.open_bytes,
                        bytes_after: state.ledger.open_bytes,
                        records_before: open.len() as u64,
                        records_after: open.len() as u64,
                        events_dropped: 0,
                        dry_run,
                    };
                    event.log();
                    if dry_run {
                        items.push(WorkItem::virtual_raw(event.segment, event.bytes_before, open));
                    } else if let Some(id) = self.seal_locked(&mut state)? {
                        if let Some(segment) = self.catalog_snapshot().get(id) {
                            event.bytes_after = segment.meta().bytes;
                        }
                        sealed = Some(id);
                    }
                    events.push(event);
                }
            }
        }

        if let Some(id) = sealed {
            // Queued behind this pass; a no-op if the pass compacts it first.
            self.hand_off(id);
        }

        let catalog = self.catalog_snapshot();
        let mut all: Vec<WorkItem> = catalog.segments().iter().cloned().map(WorkItem::sealed).collect();
        all.extend(items);

        // 2-4. Per segment: forced compaction, downsampling, eviction.
        for mut item in all {
            if item.start() >= raw_cutoff {
                // Nothing in this segment is old enough for any step.
                continue;
            }

            if item.tier == SegmentTier::Raw && item.end() < raw_cutoff {
                let records = item.records()?.to_vec();
                let next = compact(&records, &self.compaction_config);
                self.retention_step(&mut item, RetentionAction::Compact, next, now, dry_run, &mut events)?;
            }

            for step in &policy.downsample {
                let cutoff = now - step.older_than;
                if item.is_empty() || item.start() >= cutoff {
                    continue;
                }
                let records = item.records()?.to_vec();
                let next = downsample(&records, cutoff, step.granularity_secs);
                if next != records {
                    self.retention_step(&mut item, RetentionAction::Downsample, next, now, dry_run, &mut events)?;
                }
            }

            if let Some(horizon) = policy.evict_older_than {
                let cutoff = now - horizon;
                if !item.is_empty() && item.start() < cutoff {
                    let records = item.records()?.to_vec();
                    let next = evict(&records, cutoff);
                    if next.len() != records.len() {
                        self.retention_step(&mut item, RetentionAction::Evict, next, now, dry_run, &mut events)?;
                    }
                }
            }
        }

        if let Some(path) = &policy.event_log {
            persist_events(path, &events)?;
        }
        let footprint_after = Footprint::from(&lock(&self.writer).ledger);
        info!(
            dry_run,
            actions = events.len(),
            bytes_before = footprint_before.total_bytes,
            bytes_after = footprint_after.total_bytes,
            "retention pass finished"
        );
        Ok(RetentionReport {
            dry_run,
            now,
            events,
            footprint_before,
            footprint_after,
        })
    }

    /// Apply one retention action to `item`, recording its event.
    fn retention_step(
        &self,
        item: &mut WorkItem,
        action: RetentionAction,
        next: Vec<Record>,
        now: DateTime<Utc>,
        dry_run: bool,
        events: &mut Vec<RetentionEvent>,
    ) -> Result<()> {
        let records_before = item.len() as u64;
        let events_before: u64 = item.records()?.iter().map(Record::events).sum();
        let events_after: u64 = next.iter().map(Record::events).sum();
        let mut event = RetentionEvent {
            timestamp: now,
            action,
            segment: item.id,
            range_start: item.start(),
            range_end: item.end(),
            bytes_before: item.bytes,
            bytes_after: estimate_bytes(item.bytes, records_before, next.len() as u64),
            records_before,
            records_after: next.len() as u64,
            events_dropped: events_before.saturating_sub(events_after),
            dry_run,
        };
        event.log();

        if !dry_run {
            let source = item
                .source
                .clone()
                .ok_or(eq_common::Error::SegmentNotFound { id: item.id })?;
            let replacement = if next.is_empty() {
                None
            } else {
                let generation = match item.tier {
                    SegmentTier::Raw => 0,
                    SegmentTier::Compacted => item.generation + 1,
                };
                Some(write_segment(&self.dir, SegmentTier::Compacted, item.id, generation, &next)?)
            };
            self.swap_segment(&source, replacement.clone())?;
            if action == RetentionAction::Evict {
                lock(&self.writer).ledger.evicted_events += event.events_dropped;
            }
            event.bytes_after = replacement.as_ref().map_or(0, |m| m.bytes);
            item.source = replacement
                .as_ref()
                .and_then(|m| self.catalog_snapshot().get(m.id).cloned());
            if let Some(meta) = &replacement {
                item.tier = meta.tier;
                item.generation = meta.generation;
            }
        } else {
            item.tier = SegmentTier::Compacted;
            item.generation += 1;
        }
        item.bytes = event.bytes_after;
        item.loaded = Some(next);
        events.push(event);
        Ok(())
    }
}

/// A segment as seen by one retention pass.
struct WorkItem {
    id: u64,
    tier: SegmentTier,
    generation: u32,
    bytes: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source: Option<Arc<SegmentFile>>,
    loaded: Option<Vec<Record>>,
}

impl WorkItem {
    fn sealed(segment: Arc<SegmentFile>) -> Self {
        let meta = segment.meta();
        WorkItem {
            id: meta.id,
            tier: meta.tier,
            generation: meta.generation,
            bytes: meta.bytes,
            start: meta.start,
            end: meta.end,
            loaded: None,
            source: Some(segment),
        }
    }

    /// The open segment as it would be sealed; only used in dry runs.
    fn virtual_raw(id: u64, bytes: u64, records: Vec<Record>) -> Self {
        WorkItem {
            id,
            tier: SegmentTier::Raw,
            generation: 0,
            bytes,
            start: records.first().map(Record::start).unwrap_or_default(),
            end: records.iter().map(Record::end).max().unwrap_or_default(),
            source: None,
            loaded: Some(records),
        }
    }

    fn records(&mut self) -> Result<&[Record]> {
        if self.loaded.is_none() {
            let records = match &self.source {
                Some(segment) => segment.read_records()?,
                None => Vec::new(),
            };
            self.loaded = Some(records);
        }
        Ok(self.loaded.as_deref().unwrap_or_default())
    }

    fn start(&self) -> DateTime<Utc> {
        self.loaded
            .as_ref()
            .and_then(|r| r.first().map(Record::start))
            .unwrap_or(self.start)
    }

    fn end(&self) -> DateTime<Utc> {
        self.loaded
            .as_ref()
            .and_then(|r| r.iter().map(Record::end).max())
            .unwrap_or(self.end)
    }

    fn len(&self) -> usize {
        self.loaded.as_ref().map_or(0, Vec::len)
    }

    fn is_empty(&self) -> bool {
        self.loaded.as_ref().is_some_and(Vec::is_empty)
    }
}
