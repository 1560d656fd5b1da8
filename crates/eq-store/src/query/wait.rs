//! Waiting-time estimates.
//!
//! A wait is never stored: it is derived at query time from the queue length
//! and a pluggable [`ThroughputModel`], so changing the model never
//! invalidates stored data.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::query::{overlap_weight, RangeReader};
use crate::record::Record;

/// Longest wait tracked individually; longer waits share the last bin.
const MAX_WAIT_MINUTES: u32 = 7 * 24 * 60;

/// Maps a queue length at an instant to an expected wait.
pub trait ThroughputModel: Send + Sync {
    /// Expected wait in seconds, or `None` when the model has no estimate
    /// (for example a closed crossing with zero throughput).
    fn wait_secs(&self, queue_length: f64, at: DateTime<Utc>) -> Option<f64>;
}

/// Constant processing rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedThroughput {
    pub vehicles_per_hour: f64,
}

impl ThroughputModel for FixedThroughput {
    fn wait_secs(&self, queue_length: f64, _at: DateTime<Utc>) -> Option<f64> {
        (self.vehicles_per_hour > 0.0).then(|| queue_length / self.vehicles_per_hour * 3600.0)
    }
}

/// Processing rate per UTC hour of day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyThroughput {
    pub per_hour: [f64; 24],
}

impl HourlyThroughput {
    /// Parse a JSON array of 24 hourly rates.
    pub fn from_json(json: &str) -> Result<Self> {
        let rates: Vec<f64> = serde_json::from_str(json)?;
        let per_hour: [f64; 24] = rates.try_into().map_err(|rates: Vec<f64>| {
            StoreError::from(eq_common::Error::Config(format!(
                "hourly profile needs 24 rates, got {}",
                rates.len()
            )))
        })?;
        Ok(HourlyThroughput { per_hour })
    }
}

impl ThroughputModel for HourlyThroughput {
    fn wait_secs(&self, queue_length: f64, at: DateTime<Utc>) -> Option<f64> {
        let rate = self.per_hour[at.hour() as usize];
        (rate > 0.0).then(|| queue_length / rate * 3600.0)
    }
}

/// Distribution of estimated waits over a range, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WaitSummary {
    pub samples: u64,
    pub min: Option<f64>,
    pub avg: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub max: Option<f64>,
}

/// Weighted histogram with one-minute bins.
#[derive(Debug, Default)]
struct WaitHistogram {
    bins: BTreeMap<u32, f64>,
    weight: f64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl WaitHistogram {
    fn add(&mut self, wait: f64, weight: f64) {
        if weight <= 0.0 || !wait.is_finite() {
            return;
        }
        let bin = ((wait / 60.0).floor().max(0.0) as u32).min(MAX_WAIT_MINUTES);
        *self.bins.entry(bin).or_default() += weight;
        self.weight += weight;
        self.sum += wait * weight;
        self.min = Some(self.min.map_or(wait, |m| m.min(wait)));
        self.max = Some(self.max.map_or(wait, |m| m.max(wait)));
    }

    fn percentile(&self, q: f64) -> Option<f64> {
        let (min, max) = (self.min?, self.max?);
        let target = q * self.weight;
        let mut seen = 0.0;
        for (&bin, &weight) in &self.bins {
            seen += weight;
            if seen >= target {
                let mid = (bin as f64 + 0.5) * 60.0;
                return Some(mid.clamp(min, max));
            }
        }
        Some(max)
    }

    fn summary(&self) -> WaitSummary {
        if self.weight <= 0.0 {
            return WaitSummary::default();
        }
        WaitSummary {
            samples: self.weight.round() as u64,
            min: self.min,
            avg: Some(self.sum / self.weight),
            p50: self.percentile(0.5),
            p90: self.percentile(0.9),
            max: self.max,
        }
    }
}

/// Feed `(value, weight, at)` pieces of a span record to `add`, split at UTC
/// hour boundaries so hourly models see the right rate.
fn split_hourly(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    count: u64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    mut add: impl FnMut(f64, DateTime<Utc>),
) {
    let lo = start.max(from);
    let hi = end.min(to);
    if hi <= lo {
        let w = overlap_weight(count, start, end, from, to);
        if w > 0.0 {
            add(w, lo);
        }
        return;
    }
    let mut cursor = lo;
    while cursor < hi {
        let next_hour = cursor
            .duration_trunc(Duration::hours(1))
            .map(|h| h + Duration::hours(1))
            .unwrap_or(hi);
        let piece_end = next_hour.min(hi);
        // Pieces are half-open except the last, so a sample on an hour
        // boundary is counted once.
        let upper = if piece_end < hi {
            piece_end - Duration::microseconds(1)
        } else {
            piece_end
        };
        let w = overlap_weight(count, start, end, cursor, upper);
        if w > 0.0 {
            add(w, cursor);
        }
        cursor = piece_end;
    }
}

/// Summarize waits over every record the reader yields.
pub(crate) fn estimate(reader: RangeReader, model: &dyn ThroughputModel) -> Result<WaitSummary> {
    let (from, to) = (reader.start(), reader.end());
    let mut histogram = WaitHistogram::default();

    for record in reader {
        match record? {
            Record::Sample(obs) => {
                if let Some(wait) = model.wait_secs(obs.queue_length as f64, obs.timestamp) {
                    histogram.add(wait, 1.0);
                }
            }
            Record::Run(run) => {
                split_hourly(run.start, run.end, run.count, from, to, |weight, at| {
                    if let Some(wait) = model.wait_secs(run.value as f64, at) {
                        histogram.add(wait, weight);
                    }
                });
            }
            Record::Rollup(rollup) if !rollup.is_gap_only() => {
                split_hourly(rollup.start, rollup.end, rollup.samples, from, to, |weight, at| {
                    if let Some(wait) = model.wait_secs(rollup.mean, at) {
                        histogram.add(wait, weight);
                    }
                });
            }
            Record::Rollup(_) | Record::Gap(_) => {}
        }
    }
    Ok(histogram.summary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryOptions;
    use crate::record::{CompactedRun, GapSpan};
    use chrono::TimeZone;
    use eq_common::Observation;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn sample(minute: i64, value: u32) -> Record {
        Record::Sample(Observation::new(at(minute), value))
    }

    fn estimate_over(records: Vec<Record>, model: &dyn ThroughputModel) -> WaitSummary {
        let reader = RangeReader::new(at(0), at(600), Vec::new(), records, QueryOptions::default());
        estimate(reader, model).unwrap()
    }

    #[test]
    fn fixed_throughput_converts_length_to_wait() {
        let model = FixedThroughput { vehicles_per_hour: 60.0 };
        let summary = estimate_over(vec![sample(0, 10), sample(1, 20), sample(2, 30)], &model);
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.min, Some(600.0));
        assert_eq!(summary.max, Some(1800.0));
        assert_eq!(summary.avg, Some(1200.0));
        assert_eq!(summary.p50, Some(1230.0));
    }

    #[test]
    fn runs_weigh_by_count_and_gaps_are_ignored() {
        let model = FixedThroughput { vehicles_per_hour: 60.0 };
        let records = vec![
            Record::Run(CompactedRun {
                start: at(0),
                end: at(18),
                value: 5,
                min: 5,
                max: 5,
                count: 19,
                lane_count: None,
            }),
            Record::Gap(GapSpan { start: at(19), end: at(19), count: 1 }),
            sample(20, 50),
        ];
        let summary = estimate_over(records, &model);
        assert_eq!(summary.samples, 20);
        assert_eq!(summary.p50, Some(330.0));
        assert_eq!(summary.p90, Some(330.0));
        assert_eq!(summary.max, Some(3000.0));
    }

    #[test]
    fn run_across_an_hour_boundary_counts_each_sample_once() {
        let mut per_hour = [60.0; 24];
        per_hour[1] = 120.0;
        let model = HourlyThroughput { per_hour };
        let run = Record::Run(CompactedRun {
            start: at(50),
            end: at(69),
            value: 10,
            min: 10,
            max: 10,
            count: 20,
            lane_count: None,
        });
        let summary = estimate_over(vec![run], &model);
        assert_eq!(summary.samples, 20);
        assert_eq!(summary.max, Some(600.0));
        assert_eq!(summary.min, Some(300.0));
        assert_eq!(summary.avg, Some(450.0));
    }

    #[test]
    fn hourly_profile_uses_hour_of_day() {
        let mut per_hour = [60.0; 24];
        per_hour[1] = 120.0;
        let model = HourlyThroughput { per_hour };
        assert_eq!(model.wait_secs(10.0, at(0)), Some(600.0));
        assert_eq!(model.wait_secs(10.0, at(61)), Some(300.0));

        let closed = HourlyThroughput { per_hour: [0.0; 24] };
        assert_eq!(estimate_over(vec![sample(0, 3)], &closed), WaitSummary::default());
    }

    #[test]
    fn hourly_profile_json_needs_24_rates() {
        assert!(HourlyThroughput::from_json("[1, 2, 3]").is_err());
        let json = serde_json::to_string(&vec![30.0; 24]).unwrap();
        assert_eq!(HourlyThroughput::from_json(&json).unwrap().per_hour[5], 30.0);
    }

    #[test]
    fn empty_range_has_no_statistics() {
        let model = FixedThroughput { vehicles_per_hour: 60.0 };
        let summary = estimate_over(Vec::new(), &model);
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.avg, None);
    }
}
