//! Activity summary: how often each queue length occurred, how often it
//! changed, the longest unchanged stretch and how much data is missing.
//!
//! Counting works on value-bearing records in order, so a run of N equal
//! samples and the compacted run replacing them produce the same numbers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::query::{overlap_weight, RangeReader};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LongestRun {
    pub value: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub observations: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    /// Observations per distinct queue length.
    pub regimes: BTreeMap<u32, u64>,
    /// Value transitions between consecutive observations.
    pub changes: u64,
    pub longest_run: Option<LongestRun>,
    /// Failed fetches.
    pub gap_count: u64,
    /// Stretches of consecutive failed fetches.
    pub gap_periods: u64,
    /// Time without data, from the first failed fetch of a stretch to the
    /// next observation.
    pub gap_total_secs: i64,
    pub observations: u64,
    /// Observations folded into rollups; counted but not value-resolved.
    pub rolled_up_samples: u64,
}

#[derive(Debug, Default)]
struct Tally {
    summary: ActivitySummary,
    last_value: Option<u32>,
    streak: Option<LongestRun>,
    gap_open: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Tally {
    fn value_span(&mut self, value: u32, start: DateTime<Utc>, end: DateTime<Utc>, count: u64) {
        if count == 0 {
            return;
        }
        if let Some((gap_start, _)) = self.gap_open.take() {
            self.summary.gap_total_secs += (start - gap_start).num_seconds();
        }
        *self.summary.regimes.entry(value).or_default() += count;
        self.summary.observations += count;

        if self.last_value.is_some_and(|last| last != value) {
            self.summary.changes += 1;
        }
        self.last_value = Some(value);

        match &mut self.streak {
            Some(streak) if streak.value == value => {
                streak.end = end;
                streak.observations += count;
            }
            _ => {
                self.close_streak();
                self.streak = Some(LongestRun {
                    value,
                    start,
                    end,
                    observations: count,
                });
            }
        }
    }

    fn gap(&mut self, start: DateTime<Utc>, end: DateTime<Utc>, count: u64) {
        self.summary.gap_count += count;
        self.close_streak();
        self.gap_open = match self.gap_open {
            Some((open_start, _)) => Some((open_start, end)),
            None => {
                self.summary.gap_periods += 1;
                Some((start, end))
            }
        };
    }

    fn close_streak(&mut self) {
        let Some(streak) = self.streak.take() else {
            return;
        };
        let longer = self
            .summary
            .longest_run
            .map_or(true, |best| streak.observations > best.observations);
        if longer {
            self.summary.longest_run = Some(streak);
        }
    }

    fn finish(mut self) -> ActivitySummary {
        self.close_streak();
        if let Some((start, end)) = self.gap_open.take() {
            self.summary.gap_total_secs += (end - start).num_seconds();
        }
        self.summary
    }
}

fn clipped(count: u64, start: DateTime<Utc>, end: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    overlap_weight(count, start, end, from, to).round() as u64
}

/// Summarize activity over every record the reader yields.
pub(crate) fn summarize(reader: RangeReader) -> Result<ActivitySummary> {
    let (from, to) = (reader.start(), reader.end());
    let mut tally = Tally::default();

    for record in reader {
        match record? {
            Record::Sample(obs) => tally.value_span(obs.queue_length, obs.timestamp, obs.timestamp, 1),
            Record::Run(run) => {
                let count = clipped(run.count, run.start, run.end, from, to);
                tally.value_span(run.value, run.start.max(from), run.end.min(to), count);
            }
            Record::Gap(span) => {
                let count = clipped(span.count, span.start, span.end, from, to);
                if count > 0 {
                    tally.gap(span.start.max(from), span.end.min(to), count);
                }
            }
            Record::Rollup(rollup) => {
                tally.close_streak();
                tally.summary.rolled_up_samples += clipped(rollup.samples, rollup.start, rollup.end, from, to);
                if rollup.gaps > 0 {
                    tally.summary.gap_count += clipped(rollup.gaps, rollup.start, rollup.end, from, to);
                }
            }
        }
    }
    Ok(tally.finish())
}
