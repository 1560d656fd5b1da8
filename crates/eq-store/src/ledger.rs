//! Storage ledger: bytes and counts per tier.
//!
//! The ledger is owned by the store and only touched under its mutation
//! lock. It is snapshotted into `meta.json` but never trusted blindly: it can
//! always be rebuilt from the catalog and the open log, and `verify` does so
//! from a full file scan.

use serde::{Deserialize, Serialize};

use crate::segment::{SegmentMeta, SegmentTier};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub raw_bytes: u64,
    pub raw_segments: u64,
    pub raw_records: u64,
    pub compacted_bytes: u64,
    pub compacted_segments: u64,
    pub compacted_records: u64,
    pub open_bytes: u64,
    pub open_records: u64,
    pub index_bytes: u64,
    /// Ingestion events (samples and gaps) still represented in storage.
    pub events: u64,
    /// Queue-length samples still represented in storage.
    pub observations: u64,
    /// Lifetime count of committed appends.
    #[serde(default)]
    pub appended_total: u64,
    /// Lifetime count of duplicates merged without growth.
    #[serde(default)]
    pub merged_duplicates: u64,
    /// Lifetime count of events dropped by retention eviction.
    #[serde(default)]
    pub evicted_events: u64,
}

impl Ledger {
    pub fn add_segment(&mut self, meta: &SegmentMeta) {
        match meta.tier {
            SegmentTier::Raw => {
                self.raw_bytes += meta.bytes;
                self.raw_segments += 1;
                self.raw_records += meta.records;
            }
            SegmentTier::Compacted => {
                self.compacted_bytes += meta.bytes;
                self.compacted_segments += 1;
                self.compacted_records += meta.records;
            }
        }
        self.events += meta.events;
        self.observations += meta.observations;
    }

    pub fn remove_segment(&mut self, meta: &SegmentMeta) {
        match meta.tier {
            SegmentTier::Raw => {
                self.raw_bytes = self.raw_bytes.saturating_sub(meta.bytes);
                self.raw_segments = self.raw_segments.saturating_sub(1);
                self.raw_records = self.raw_records.saturating_sub(meta.records);
            }
            SegmentTier::Compacted => {
                self.compacted_bytes = self.compacted_bytes.saturating_sub(meta.bytes);
                self.compacted_segments = self.compacted_segments.saturating_sub(1);
                self.compacted_records = self.compacted_records.saturating_sub(meta.records);
            }
        }
        self.events = self.events.saturating_sub(meta.events);
        self.observations = self.observations.saturating_sub(meta.observations);
    }

    /// Account for one committed append to the open log.
    pub fn record_append(&mut self, frame_bytes: u64, observations: u64) {
        self.open_bytes += frame_bytes;
        self.open_records += 1;
        self.events += 1;
        self.observations += observations;
        self.appended_total += 1;
    }

    /// The open log's entries moved into a sealed segment.
    ///
    /// Event counts move with the segment, so they are taken out here and put
    /// back by [`Ledger::add_segment`].
    pub fn clear_open(&mut self, open_events: u64, open_observations: u64) {
        self.open_bytes = 0;
        self.open_records = 0;
        self.events = self.events.saturating_sub(open_events);
        self.observations = self.observations.saturating_sub(open_observations);
    }

    pub fn total_bytes(&self) -> u64 {
        self.raw_bytes + self.compacted_bytes + self.open_bytes + self.index_bytes
    }

    pub fn stored_records(&self) -> u64 {
        self.raw_records + self.compacted_records + self.open_records
    }

    /// Events represented per stored record. 1.0 means nothing was folded.
    pub fn compaction_ratio(&self) -> f64 {
        let records = self.stored_records();
        if records == 0 {
            1.0
        } else {
            self.events as f64 / records as f64
        }
    }

    /// Compare the fields a full scan can recompute. Lifetime counters are
    /// not derivable from files and are ignored.
    pub fn diff(&self, scanned: &Ledger) -> Vec<LedgerMismatch> {
        let pairs = [
            ("raw_bytes", self.raw_bytes, scanned.raw_bytes),
            ("raw_segments", self.raw_segments, scanned.raw_segments),
            ("raw_records", self.raw_records, scanned.raw_records),
            ("compacted_bytes", self.compacted_bytes, scanned.compacted_bytes),
            ("compacted_segments", self.compacted_segments, scanned.compacted_segments),
            ("compacted_records", self.compacted_records, scanned.compacted_records),
            ("open_bytes", self.open_bytes, scanned.open_bytes),
            ("open_records", self.open_records, scanned.open_records),
            ("events", self.events, scanned.events),
            ("observations", self.observations, scanned.observations),
        ];
        pairs
            .into_iter()
            .filter(|(_, tracked, found)| tracked != found)
            .map(|(field, tracked, found)| LedgerMismatch {
                field: field.to_string(),
                tracked,
                scanned: found,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerMismatch {
    pub field: String,
    pub tracked: u64,
    pub scanned: u64,
}

/// Footprint diagnostics handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Footprint {
    pub raw_bytes: u64,
    pub open_bytes: u64,
    pub compacted_bytes: u64,
    pub index_bytes: u64,
    pub total_bytes: u64,
    pub raw_records: u64,
    pub open_records: u64,
    pub compacted_records: u64,
    pub raw_segments: u64,
    pub compacted_segments: u64,
    pub events: u64,
    pub observations: u64,
    pub appended_total: u64,
    pub merged_duplicates: u64,
    pub evicted_events: u64,
    pub compaction_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentMeta>>,
}

impl From<&Ledger> for Footprint {
    fn from(ledger: &Ledger) -> Self {
        Footprint {
            raw_bytes: ledger.raw_bytes,
            open_bytes: ledger.open_bytes,
            compacted_bytes: ledger.compacted_bytes,
            index_bytes: ledger.index_bytes,
            total_bytes: ledger.total_bytes(),
            raw_records: ledger.raw_records,
            open_records: ledger.open_records,
            compacted_records: ledger.compacted_records,
            raw_segments: ledger.raw_segments,
            compacted_segments: ledger.compacted_segments,
            events: ledger.events,
            observations: ledger.observations,
            appended_total: ledger.appended_total,
            merged_duplicates: ledger.merged_duplicates,
            evicted_events: ledger.evicted_events,
            compaction_ratio: ledger.compaction_ratio(),
            segments: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn meta(tier: SegmentTier, bytes: u64, records: u64, events: u64) -> SegmentMeta {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        SegmentMeta {
            id: 1,
            tier,
            generation: 0,
            start: t,
            end: t,
            records,
            events,
            observations: events,
            bytes,
            checksum: String::new(),
            file: String::new(),
        }
    }

    #[test]
    fn seal_moves_counts_from_open_to_raw() {
        let mut ledger = Ledger::default();
        for _ in 0..10 {
            ledger.record_append(26, 1);
        }
        assert_eq!(ledger.open_records, 10);
        assert_eq!(ledger.events, 10);

        ledger.clear_open(10, 10);
        ledger.add_segment(&meta(SegmentTier::Raw, 900, 10, 10));
        assert_eq!(ledger.open_bytes, 0);
        assert_eq!(ledger.raw_records, 10);
        assert_eq!(ledger.events, 10);
        assert_eq!(ledger.appended_total, 10);
    }

    #[test]
    fn compaction_ratio_counts_folded_events() {
        let mut ledger = Ledger::default();
        ledger.add_segment(&meta(SegmentTier::Compacted, 400, 4, 100));
        assert_eq!(ledger.compaction_ratio(), 25.0);
        assert_eq!(Ledger::default().compaction_ratio(), 1.0);
    }

    #[test]
    fn diff_ignores_lifetime_counters() {
        let mut tracked = Ledger::default();
        tracked.appended_total = 50;
        tracked.raw_bytes = 10;
        let scanned = Ledger::default();
        let diff = tracked.diff(&scanned);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].field, "raw_bytes");
    }
}
