//! Bucketed queue-length series.
//!
//! Buckets start at the query start and are `resolution` wide; the last one
//! also includes the query end. Queue length is a step function, so a bucket
//! with nothing in it holds the previous state forward, and a bucket whose
//! state is a recorded gap reports no value at all.

use chrono::{DateTime, Duration, Utc};
use eq_common::{Aggregation, Resolution};
use serde::Serialize;

use crate::error::Result;
use crate::query::{overlap_weight, RangeReader};
use crate::record::Record;

/// One output bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub start: DateTime<Utc>,
    /// Aggregated queue length; `None` means no data.
    pub value: Option<f64>,
    /// Observations that fell in the bucket (run overlap counted
    /// proportionally). Zero when the value is carried forward.
    pub samples: u64,
    /// Failed fetches inside the bucket.
    pub gaps: u64,
}

#[derive(Debug)]
struct Accumulator {
    aggregation: Aggregation,
    weight: f64,
    sum: f64,
    max: Option<f64>,
    min: Option<f64>,
    first: Option<f64>,
    gaps: f64,
}

impl Accumulator {
    fn new(aggregation: Aggregation) -> Self {
        Accumulator {
            aggregation,
            weight: 0.0,
            sum: 0.0,
            max: None,
            min: None,
            first: None,
            gaps: 0.0,
        }
    }

    fn add(&mut self, weight: f64, mean: f64, min: f64, max: f64) {
        self.weight += weight;
        self.sum += weight * mean;
        self.max = Some(self.max.map_or(max, |m| m.max(max)));
        self.min = Some(self.min.map_or(min, |m| m.min(min)));
        self.first.get_or_insert(mean);
    }

    fn value(&self) -> Option<f64> {
        if self.weight <= 0.0 {
            return None;
        }
        match self.aggregation {
            Aggregation::Mean => Some(self.sum / self.weight),
            Aggregation::Max => self.max,
            Aggregation::Min => self.min,
            Aggregation::First => self.first,
        }
    }
}

/// Lazy iterator of [`SeriesPoint`]s.
#[derive(Debug)]
pub struct SeriesIter {
    reader: RangeReader,
    peeked: Option<Record>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step_micros: i64,
    buckets: i64,
    index: i64,
    aggregation: Aggregation,
    /// Records that started in an earlier bucket but reach into later ones.
    spill: Vec<Record>,
    carry: Option<f64>,
    seeded: bool,
    failed: bool,
}

/// Number of buckets covering `[start, end]` at `resolution`.
pub fn bucket_count(start: DateTime<Utc>, end: DateTime<Utc>, resolution: Resolution) -> u64 {
    let span = (end - start).num_microseconds().unwrap_or(i64::MAX);
    let step = resolution.as_micros();
    if span <= 0 {
        1
    } else {
        (span / step + i64::from(span % step != 0)).max(1) as u64
    }
}

impl SeriesIter {
    pub(crate) fn new(reader: RangeReader, resolution: Resolution, aggregation: Aggregation) -> Self {
        let start = reader.start();
        let end = reader.end();
        SeriesIter {
            buckets: bucket_count(start, end, resolution) as i64,
            reader,
            peeked: None,
            start,
            end,
            step_micros: resolution.as_micros(),
            index: 0,
            aggregation,
            spill: Vec::new(),
            carry: None,
            seeded: false,
            failed: false,
        }
    }

    /// Number of buckets the iterator yields in total.
    pub fn bucket_count(&self) -> usize {
        self.buckets as usize
    }

    /// Reset to the first bucket.
    pub fn rewind(&mut self) {
        self.reader.rewind();
        self.peeked = None;
        self.index = 0;
        self.spill.clear();
        self.carry = None;
        self.seeded = false;
        self.failed = false;
    }

    fn peek(&mut self) -> Result<Option<&Record>> {
        if self.peeked.is_none() {
            match self.reader.next() {
                Some(Ok(record)) => self.peeked = Some(record),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        Ok(self.peeked.as_ref())
    }

    fn seed(&mut self) -> Result<()> {
        // Pulling the first in-range record settles the record just before
        // the range.
        self.peek()?;
        self.carry = self.reader.lead().and_then(|r| r.closing_value());
        self.seeded = true;
        Ok(())
    }

    fn bucket_bounds(&self, index: i64) -> (DateTime<Utc>, DateTime<Utc>, bool) {
        let lo = self.start + Duration::microseconds(self.step_micros.saturating_mul(index));
        let last = index + 1 >= self.buckets;
        let hi = if last {
            self.end
        } else {
            lo + Duration::microseconds(self.step_micros)
        };
        (lo, hi, last)
    }

    fn contribute(
        acc: &mut Accumulator,
        record: &Record,
        lo: DateTime<Utc>,
        hi: DateTime<Utc>,
        last: bool,
    ) {
        // Half-open buckets, except the last which includes its end.
        let upper = if last {
            hi
        } else {
            hi - Duration::microseconds(1)
        };
        match record {
            Record::Sample(obs) => {
                if in_bucket(obs.timestamp, lo, upper) {
                    let v = obs.queue_length as f64;
                    acc.add(1.0, v, v, v);
                }
            }
            Record::Run(run) => {
                let w = overlap_weight(run.count, run.start, run.end, lo, upper);
                if w > 0.0 {
                    acc.add(w, run.value as f64, run.min as f64, run.max as f64);
                }
            }
            Record::Gap(span) => {
                acc.gaps += overlap_weight(span.count, span.start, span.end, lo, upper);
            }
            Record::Rollup(rollup) => {
                let w = overlap_weight(rollup.samples, rollup.start, rollup.end, lo, upper);
                if w > 0.0 {
                    acc.add(w, rollup.mean, rollup.min as f64, rollup.max as f64);
                }
                acc.gaps += overlap_weight(rollup.gaps, rollup.start, rollup.end, lo, upper);
            }
        }
    }

    fn next_bucket(&mut self) -> Result<SeriesPoint> {
        let (lo, hi, last) = self.bucket_bounds(self.index);
        let mut acc = Accumulator::new(self.aggregation);
        // State at the start of the bucket, before anything inside it.
        let carried = self.carry;

        let mut still_open = Vec::new();
        for record in std::mem::take(&mut self.spill) {
            Self::contribute(&mut acc, &record, lo, hi, last);
            if !last && record.end() >= hi {
                still_open.push(record);
            }
        }

        loop {
            let starts_inside = match self.peek()? {
                None => false,
                Some(record) if last => record.start() <= hi,
                Some(record) => record.start() < hi,
            };
            if !starts_inside {
                break;
            }
            let Some(record) = self.peeked.take() else {
                break;
            };
            Self::contribute(&mut acc, &record, lo, hi, last);
            self.carry = record.closing_value();
            if !last && record.end() >= hi {
                still_open.push(record);
            }
        }
        self.spill = still_open;

        let value = match acc.value() {
            Some(v) => Some(v),
            None if acc.gaps > 0.0 => None,
            None => carried,
        };
        Ok(SeriesPoint {
            start: lo,
            value,
            samples: rounded_count(acc.weight),
            gaps: rounded_count(acc.gaps),
        })
    }
}

fn rounded_count(weight: f64) -> u64 {
    if weight > 0.0 {
        (weight.round() as u64).max(1)
    } else {
        0
    }
}

fn in_bucket(at: DateTime<Utc>, lo: DateTime<Utc>, upper: DateTime<Utc>) -> bool {
    at >= lo && at <= upper
}

impl Iterator for SeriesIter {
    type Item = Result<SeriesPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.buckets {
            return None;
        }
        if !self.seeded {
            if let Err(e) = self.seed() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let point = self.next_bucket();
        match point {
            Ok(_) => self.index += 1,
            Err(_) => self.failed = true,
        }
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.buckets - self.index).max(0) as usize;
        (0, Some(left))
    }
}
