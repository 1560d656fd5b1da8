//! Retention policy: forced compaction of aged raw data, downsampling of old
//! history into rollups, and eviction past the hard horizon.
//!
//! The functions here are pure record transformations; the store applies
//! them segment by segment and emits one [`RetentionEvent`] per action.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use eq_config::RetentionSettings;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::ledger::Footprint;
use crate::record::{Record, Rollup};

/// One downsampling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownsampleStep {
    pub older_than: Duration,
    pub granularity_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Raw data older than this is compacted even without a seal.
    pub raw_horizon: Duration,
    /// Applied in order; each collapses older records into rollups.
    pub downsample: Vec<DownsampleStep>,
    /// Records ending before `now - evict_older_than` are dropped.
    pub evict_older_than: Option<Duration>,
    /// JSONL file receiving every event.
    pub event_log: Option<PathBuf>,
}

impl RetentionPolicy {
    pub fn from_settings(settings: &RetentionSettings) -> Self {
        RetentionPolicy {
            raw_horizon: Duration::days(i64::from(settings.raw_horizon_days)),
            downsample: settings
                .downsample
                .iter()
                .map(|rule| DownsampleStep {
                    older_than: Duration::days(i64::from(rule.older_than_days)),
                    granularity_secs: rule.granularity_secs,
                })
                .collect(),
            evict_older_than: settings
                .evict_older_than_days
                .map(|days| Duration::days(i64::from(days))),
            event_log: settings.event_log.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    /// The open segment was sealed because its data aged past the raw horizon.
    ForceSeal,
    /// A raw segment was compacted because it aged past the raw horizon.
    Compact,
    /// Old records were collapsed into rollups.
    Downsample,
    /// Records were dropped for good.
    Evict,
}

impl std::fmt::Display for RetentionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RetentionAction::ForceSeal => "force_seal",
            RetentionAction::Compact => "compact",
            RetentionAction::Downsample => "downsample",
            RetentionAction::Evict => "evict",
        };
        f.write_str(name)
    }
}

/// A single retention action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionEvent {
    pub timestamp: DateTime<Utc>,
    pub action: RetentionAction,
    pub segment: u64,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub bytes_before: u64,
    /// Exact after a real run; proportional to the record count in a dry run.
    pub bytes_after: u64,
    pub records_before: u64,
    pub records_after: u64,
    /// Ingestion events no longer represented after this action.
    #[serde(default)]
    pub events_dropped: u64,
    pub dry_run: bool,
}

impl RetentionEvent {
    pub(crate) fn log(&self) {
        let prefix = if self.dry_run { "[DRY-RUN] " } else { "" };
        info!(
            action = %self.action,
            segment = self.segment,
            range_start = %self.range_start.to_rfc3339(),
            range_end = %self.range_end.to_rfc3339(),
            bytes_before = self.bytes_before,
            bytes_after = self.bytes_after,
            records_before = self.records_before,
            records_after = self.records_after,
            dry_run = self.dry_run,
            "{}retention {} on segment {}",
            prefix,
            self.action,
            self.segment
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub now: DateTime<Utc>,
    pub events: Vec<RetentionEvent>,
    pub footprint_before: Footprint,
    pub footprint_after: Footprint,
}

impl RetentionReport {
    pub fn bytes_freed(&self) -> i64 {
        self.footprint_before.total_bytes as i64 - self.footprint_after.total_bytes as i64
    }
}

/// Estimate a rewritten file's size from its record count.
pub(crate) fn estimate_bytes(bytes_before: u64, records_before: u64, records_after: u64) -> u64 {
    if records_before == 0 {
        return 0;
    }
    ((bytes_before as u128 * records_after as u128) / records_before as u128) as u64
}

/// Append `events` to the JSONL event log.
pub fn persist_events(path: &Path, events: &[RetentionEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!(count = events.len(), path = %path.display(), "retention events written");
    Ok(())
}

#[derive(Debug)]
struct RollupBuilder {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    min: Option<u32>,
    max: Option<u32>,
    sum: f64,
    samples: u64,
    gaps: u64,
}

impl RollupBuilder {
    fn new(start: DateTime<Utc>) -> Self {
        RollupBuilder {
            start,
            end: start,
            min: None,
            max: None,
            sum: 0.0,
            samples: 0,
            gaps: 0,
        }
    }

    fn values(&mut self, min: u32, max: u32, mean: f64, samples: u64) {
        if samples == 0 {
            return;
        }
        self.min = Some(self.min.map_or(min, |m| m.min(min)));
        self.max = Some(self.max.map_or(max, |m| m.max(max)));
        self.sum += mean * samples as f64;
        self.samples += samples;
    }

    fn add(&mut self, record: &Record) {
        self.start = self.start.min(record.start());
        self.end = self.end.max(record.end());
        match record {
            Record::Sample(obs) => {
                let v = obs.queue_length;
                self.values(v, v, v as f64, 1);
            }
            Record::Run(run) => self.values(run.min, run.max, run.value as f64, run.count),
            Record::Gap(span) => self.gaps += span.count,
            Record::Rollup(rollup) => {
                self.values(rollup.min, rollup.max, rollup.mean, rollup.samples);
                self.gaps += rollup.gaps;
            }
        }
    }

    fn finish(self, granularity_secs: u32) -> Record {
        Record::Rollup(Rollup {
            start: self.start,
            end: self.end,
            granularity_secs,
            min: self.min.unwrap_or(0),
            max: self.max.unwrap_or(0),
            mean: if self.samples > 0 {
                self.sum / self.samples as f64
            } else {
                0.0
            },
            samples: self.samples,
            gaps: self.gaps,
        })
    }
}

fn bucket_of(at: DateTime<Utc>, granularity_secs: u32) -> i64 {
    at.timestamp().div_euclid(i64::from(granularity_secs.max(1)))
}

/// Collapse every record ending before `cutoff` into epoch-aligned rollups
/// of `granularity_secs`, keyed by the record's start.
///
/// Rollups already at least as coarse are kept unchanged. Newer records pass
/// through untouched.
pub fn downsample(records: &[Record], cutoff: DateTime<Utc>, granularity_secs: u32) -> Vec<Record> {
    let mut out = Vec::with_capacity(records.len());
    let mut current: Option<(i64, RollupBuilder)> = None;

    for record in records {
        let keep = record.end() >= cutoff
            || matches!(record, Record::Rollup(r) if r.granularity_secs >= granularity_secs);
        if keep {
            if let Some((_, builder)) = current.take() {
                out.push(builder.finish(granularity_secs));
            }
            out.push(*record);
            continue;
        }

        let bucket = bucket_of(record.start(), granularity_secs);
        match &mut current {
            Some((key, builder)) if *key == bucket => builder.add(record),
            _ => {
                if let Some((_, builder)) = current.take() {
                    out.push(builder.finish(granularity_secs));
                }
                let mut builder = RollupBuilder::new(record.start());
                builder.add(record);
                current = Some((bucket, builder));
            }
        }
    }
    if let Some((_, builder)) = current {
        out.push(builder.finish(granularity_secs));
    }
    out
}

/// Drop every record ending before `cutoff`.
pub fn evict(records: &[Record], cutoff: DateTime<Utc>) -> Vec<Record> {
    records.iter().filter(|r| r.end() >= cutoff).copied().collect()
}

/// Number of rollups per granularity.
pub fn rollup_granularities(records: &[Record]) -> BTreeMap<u32, usize> {
    let mut out = BTreeMap::new();
    for record in records {
        if let Record::Rollup(rollup) = record {
            *out.entry(rollup.granularity_secs).or_default() += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CompactedRun, GapSpan};
    use chrono::TimeZone;
    use eq_common::Observation;
    use tempfile::tempdir;

    fn day(d: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, hour, 0, 0).unwrap()
    }

    #[test]
    fn downsample_builds_daily_min_mean_max() {
        let records = vec![
            Record::Sample(Observation::new(day(1, 1), 4)),
            Record::Run(CompactedRun {
                start: day(1, 2),
                end: day(1, 5),
                value: 10,
                min: 10,
                max: 10,
                count: 3,
                lane_count: None,
            }),
            Record::Gap(GapSpan {
                start: day(1, 6),
                end: day(1, 6),
                count: 2,
            }),
            Record::Sample(Observation::new(day(2, 1), 7)),
            Record::Sample(Observation::new(day(9, 1), 1)),
        ];
        let out = downsample(&records, day(8, 0), 86_400);
        assert_eq!(out.len(), 3);
        match out[0] {
            Record::Rollup(r) => {
                assert_eq!((r.min, r.max, r.samples, r.gaps), (4, 10, 4, 2));
                assert!((r.mean - 8.5).abs() < 1e-9);
                assert_eq!(r.start, day(1, 1));
                assert_eq!(r.end, day(1, 6));
            }
            other => panic!("expected rollup, got {:?}", other),
        }
        assert!(matches!(out[1], Record::Rollup(r) if r.samples == 1 && r.min == 7));
        assert_eq!(out[2], records[4]);
        assert_eq!(out.iter().map(Record::events).sum::<u64>(), 8);
    }

    #[test]
    fn downsample_keeps_coarser_rollups() {
        let records = downsample(
            &[Record::Sample(Observation::new(day(1, 1), 4))],
            day(8, 0),
            7 * 86_400,
        );
        let again = downsample(&records, day(8, 0), 86_400);
        assert_eq!(records, again);
        assert_eq!(rollup_granularities(&again).get(&(7 * 86_400)), Some(&1));
    }

    #[test]
    fn evict_drops_only_old_records() {
        let records = vec![
            Record::Sample(Observation::new(day(1, 0), 1)),
            Record::Sample(Observation::new(day(5, 0), 2)),
        ];
        assert_eq!(evict(&records, day(3, 0)), vec![records[1]]);
    }

    #[test]
    fn events_append_as_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/retention-events.jsonl");
        let event = RetentionEvent {
            timestamp: day(10, 0),
            action: RetentionAction::Evict,
            segment: 3,
            range_start: day(1, 0),
            range_end: day(2, 0),
            bytes_before: 100,
            bytes_after: 0,
            records_before: 5,
            records_after: 0,
            events_dropped: 5,
            dry_run: false,
        };
        persist_events(&path, &[event.clone()]).unwrap();
        persist_events(&path, &[event.clone()]).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: RetentionEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, event);
        assert!(lines[0].contains(r#""action":"evict""#));
    }

    #[test]
    fn dry_run_estimate_is_proportional() {
        assert_eq!(estimate_bytes(1000, 10, 5), 500);
        assert_eq!(estimate_bytes(1000, 0, 0), 0);
    }
}
