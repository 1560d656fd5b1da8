//! Stored record kinds.
//!
//! The open log only ever holds [`Record::Sample`] and single-instant
//! [`Record::Gap`] entries. Compaction introduces runs and merged gap spans;
//! retention introduces rollups.

use chrono::{DateTime, Utc};
use eq_common::{Candidate, Observation};
use serde::{Deserialize, Serialize};

/// One or more consecutive failed fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Number of failed fetches folded into this span.
    pub count: u64,
}

/// `value` held from `start` to `end` across `count` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactedRun {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Value of the first sample in the run.
    pub value: u32,
    pub min: u32,
    pub max: u32,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_count: Option<u16>,
}

/// Downsampled history for one bucket of `granularity_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    /// Earliest instant covered by the folded records.
    pub start: DateTime<Utc>,
    /// Latest instant covered by the folded records.
    pub end: DateTime<Utc>,
    pub granularity_secs: u32,
    pub min: u32,
    pub max: u32,
    /// Sample-weighted mean queue length.
    pub mean: f64,
    pub samples: u64,
    pub gaps: u64,
}

impl Rollup {
    /// A rollup built from nothing but failed fetches.
    pub fn is_gap_only(&self) -> bool {
        self.samples == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Sample(Observation),
    Gap(GapSpan),
    Run(CompactedRun),
    Rollup(Rollup),
}

impl Record {
    pub fn start(&self) -> DateTime<Utc> {
        match self {
            Record::Sample(o) => o.timestamp,
            Record::Gap(g) => g.start,
            Record::Run(r) => r.start,
            Record::Rollup(r) => r.start,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        match self {
            Record::Sample(o) => o.timestamp,
            Record::Gap(g) => g.end,
            Record::Run(r) => r.end,
            Record::Rollup(r) => r.end,
        }
    }

    /// Ingestion events represented by this record, gaps included.
    pub fn events(&self) -> u64 {
        match self {
            Record::Sample(_) => 1,
            Record::Gap(g) => g.count,
            Record::Run(r) => r.count,
            Record::Rollup(r) => r.samples + r.gaps,
        }
    }

    /// Queue-length samples represented by this record.
    pub fn observations(&self) -> u64 {
        match self {
            Record::Sample(_) => 1,
            Record::Gap(_) => 0,
            Record::Run(r) => r.count,
            Record::Rollup(r) => r.samples,
        }
    }

    pub fn is_gap(&self) -> bool {
        match self {
            Record::Gap(_) => true,
            Record::Rollup(r) => r.is_gap_only(),
            _ => false,
        }
    }

    /// Value this record leaves behind for step interpolation.
    ///
    /// `None` means the trailing state is "no data".
    pub fn closing_value(&self) -> Option<f64> {
        match self {
            Record::Sample(o) => Some(o.queue_length as f64),
            Record::Gap(_) => None,
            Record::Run(r) => Some(r.value as f64),
            Record::Rollup(r) if r.is_gap_only() => None,
            Record::Rollup(r) => Some(r.mean),
        }
    }

    /// Short description used in duplicate diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Record::Sample(o) => format!("queue_length={}", o.queue_length),
            Record::Gap(_) => "gap".to_string(),
            Record::Run(r) => format!("queue_length={} (run of {})", r.value, r.count),
            Record::Rollup(r) => format!("rollup mean={:.1}", r.mean),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Record::Sample(_) => "sample",
            Record::Gap(_) => "gap",
            Record::Run(_) => "run",
            Record::Rollup(_) => "rollup",
        }
    }
}

impl From<Candidate> for Record {
    fn from(candidate: Candidate) -> Self {
        match candidate {
            Candidate::Sample(obs) => Record::Sample(obs),
            Candidate::Gap(ts) => Record::Gap(GapSpan {
                start: ts,
                end: ts,
                count: 1,
            }),
        }
    }
}
