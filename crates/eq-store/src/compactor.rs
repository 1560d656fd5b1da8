//! Run-length compaction of sealed records.
//!
//! Consecutive samples that hold the same queue length (within `epsilon` of
//! the run's first value), with the same lane count and without a sampling
//! hole longer than `max_sample_gap`, fold into one [`CompactedRun`]. Short
//! runs stay as plain samples. Consecutive gap markers fold into one
//! [`GapSpan`]. Rollups pass through untouched.
//!
//! `compact` is idempotent: feeding its output back in returns the same
//! records.

use chrono::{DateTime, Duration, Utc};
use eq_common::Observation;
use eq_config::EngineConfig;

use crate::record::{CompactedRun, GapSpan, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionConfig {
    /// Largest difference from the run's first value still folded into it.
    pub epsilon: u32,
    /// Runs shorter than this stay as individual samples.
    pub min_run_length: u64,
    /// Longest spacing between samples that still counts as one run.
    pub max_sample_gap: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            epsilon: 0,
            min_run_length: 2,
            max_sample_gap: Duration::minutes(15),
        }
    }
}

impl CompactionConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        CompactionConfig {
            epsilon: config.compaction.epsilon,
            min_run_length: config.compaction.min_run_length.max(1),
            max_sample_gap: config.effective_max_sample_gap(),
        }
    }

    fn within(&self, anchor: u32, value: u32) -> bool {
        anchor.abs_diff(value) <= self.epsilon
    }
}

/// A run being built.
#[derive(Debug)]
struct RunBuilder {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    anchor: u32,
    min: u32,
    max: u32,
    count: u64,
    lane_count: Option<u16>,
    /// Original samples, kept until the run is long enough to be worth it.
    members: Vec<Observation>,
    /// Seeded from an existing run, so it is emitted as a run regardless.
    promoted: bool,
}

impl RunBuilder {
    fn from_sample(obs: Observation) -> Self {
        RunBuilder {
            start: obs.timestamp,
            end: obs.timestamp,
            anchor: obs.queue_length,
            min: obs.queue_length,
            max: obs.queue_length,
            count: 1,
            lane_count: obs.lane_count,
            members: vec![obs],
            promoted: false,
        }
    }

    fn from_run(run: CompactedRun) -> Self {
        RunBuilder {
            start: run.start,
            end: run.end,
            anchor: run.value,
            min: run.min,
            max: run.max,
            count: run.count,
            lane_count: run.lane_count,
            members: Vec::new(),
            promoted: true,
        }
    }

    fn accepts_sample(&self, obs: &Observation, cfg: &CompactionConfig) -> bool {
        cfg.within(self.anchor, obs.queue_length)
            && obs.lane_count == self.lane_count
            && obs.timestamp - self.end <= cfg.max_sample_gap
    }

    fn accepts_run(&self, run: &CompactedRun, cfg: &CompactionConfig) -> bool {
        cfg.within(self.anchor, run.value)
            && cfg.within(self.anchor, run.min)
            && cfg.within(self.anchor, run.max)
            && run.lane_count == self.lane_count
            && run.start - self.end <= cfg.max_sample_gap
    }

    fn push_sample(&mut self, obs: Observation) {
        self.end = obs.timestamp;
        self.min = self.min.min(obs.queue_length);
        self.max = self.max.max(obs.queue_length);
        self.count += 1;
        if !self.promoted {
            self.members.push(obs);
        }
    }

    fn push_run(&mut self, run: CompactedRun) {
        self.end = run.end;
        self.min = self.min.min(run.min);
        self.max = self.max.max(run.max);
        self.count += run.count;
        self.promoted = true;
        self.members.clear();
    }

    fn finish(self, cfg: &CompactionConfig, out: &mut Vec<Record>) {
        if self.promoted || self.count >= cfg.min_run_length {
            out.push(Record::Run(CompactedRun {
                start: self.start,
                end: self.end,
                value: self.anchor,
                min: self.min,
                max: self.max,
                count: self.count,
                lane_count: self.lane_count,
            }));
        } else {
            out.extend(self.members.into_iter().map(Record::Sample));
        }
    }
}

enum Pending {
    Run(RunBuilder),
    Gap(GapSpan),
}

impl Pending {
    fn finish(self, cfg: &CompactionConfig, out: &mut Vec<Record>) {
        match self {
            Pending::Run(builder) => builder.finish(cfg, out),
            Pending::Gap(span) => out.push(Record::Gap(span)),
        }
    }
}

/// Compact time-ordered `records`.
pub fn compact(records: &[Record], cfg: &CompactionConfig) -> Vec<Record> {
    let mut out = Vec::with_capacity(records.len() / 4 + 1);
    let mut pending: Option<Pending> = None;

    for record in records {
        pending = match (pending.take(), *record) {
            (Some(Pending::Run(mut run)), Record::Sample(obs)) if run.accepts_sample(&obs, cfg) => {
                run.push_sample(obs);
                Some(Pending::Run(run))
            }
            (Some(Pending::Run(mut run)), Record::Run(next)) if run.accepts_run(&next, cfg) => {
                run.push_run(next);
                Some(Pending::Run(run))
            }
            (Some(Pending::Gap(mut span)), Record::Gap(next)) => {
                span.end = span.end.max(next.end);
                span.count += next.count;
                Some(Pending::Gap(span))
            }
            (previous, next) => {
                if let Some(previous) = previous {
                    previous.finish(cfg, &mut out);
                }
                match next {
                    Record::Sample(obs) => Some(Pending::Run(RunBuilder::from_sample(obs))),
                    Record::Run(run) => Some(Pending::Run(RunBuilder::from_run(run))),
                    Record::Gap(span) => Some(Pending::Gap(span)),
                    Record::Rollup(_) => {
                        out.push(next);
                        None
                    }
                }
            }
        };
    }
    if let Some(last) = pending {
        last.finish(cfg, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn at(minute: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minute)
    }

    fn sample(minute: i64, value: u32) -> Record {
        Record::Sample(Observation::new(at(minute), value))
    }

    fn gap(minute: i64) -> Record {
        Record::Gap(GapSpan {
            start: at(minute),
            end: at(minute),
            count: 1,
        })
    }

    #[test]
    fn equal_values_fold_into_run() {
        let input: Vec<Record> = (0..10).map(|m| sample(m, 5)).collect();
        let out = compact(&input, &CompactionConfig::default());
        assert_eq!(
            out,
            vec![Record::Run(CompactedRun {
                start: at(0),
                end: at(9),
                value: 5,
                min: 5,
                max: 5,
                count: 10,
                lane_count: None,
            })]
        );
    }

    #[test]
    fn short_runs_stay_samples() {
        let input = vec![sample(0, 1), sample(1, 2), sample(2, 2), sample(3, 3)];
        let out = compact(&input, &CompactionConfig::default());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], sample(0, 1));
        assert!(matches!(out[1], Record::Run(r) if r.count == 2 && r.value == 2));
        assert_eq!(out[2], sample(3, 3));
    }

    #[test]
    fn sampling_hole_breaks_run() {
        let input = vec![sample(0, 4), sample(1, 4), sample(30, 4), sample(31, 4)];
        let out = compact(&input, &CompactionConfig::default());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| matches!(r, Record::Run(run) if run.count == 2)));
    }

    #[test]
    fn gaps_merge_and_split_runs() {
        let input = vec![sample(0, 4), sample(1, 4), gap(2), gap(3), gap(4), sample(5, 4)];
        let out = compact(&input, &CompactionConfig::default());
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[1],
            Record::Gap(GapSpan {
                start: at(2),
                end: at(4),
                count: 3
            })
        );
        assert_eq!(out[2], sample(5, 4));
    }

    #[test]
    fn epsilon_is_measured_from_run_anchor() {
        let cfg = CompactionConfig {
            epsilon: 1,
            ..CompactionConfig::default()
        };
        let input = vec![sample(0, 10), sample(1, 11), sample(2, 9), sample(3, 12)];
        let out = compact(&input, &cfg);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Record::Run(r) if r.value == 10 && r.min == 9 && r.max == 11));
        assert_eq!(out[1], sample(3, 12));
    }

    #[test]
    fn lane_change_breaks_run() {
        let mut with_lanes = Observation::new(at(2), 5);
        with_lanes.lane_count = Some(3);
        let input = vec![sample(0, 5), sample(1, 5), Record::Sample(with_lanes)];
        let out = compact(&input, &CompactionConfig::default());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Record::Sample(with_lanes));
    }

    fn arb_records() -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec((1i64..20, prop::option::weighted(0.9, 0u32..4)), 0..120).prop_map(
            |steps| {
                let mut minute = 0;
                steps
                    .into_iter()
                    .map(|(step, value)| {
                        minute += step;
                        match value {
                            Some(v) => sample(minute, v),
                            None => gap(minute),
                        }
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn compaction_is_idempotent(input in arb_records(), epsilon in 0u32..2, min_run in 1u64..4) {
            let cfg = CompactionConfig { epsilon, min_run_length: min_run, ..CompactionConfig::default() };
            let once = compact(&input, &cfg);
            let twice = compact(&once, &cfg);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn compaction_preserves_events_and_bounds(input in arb_records()) {
            let cfg = CompactionConfig::default();
            let out = compact(&input, &cfg);
            let events_in: u64 = input.iter().map(Record::events).sum();
            let events_out: u64 = out.iter().map(Record::events).sum();
            prop_assert_eq!(events_in, events_out);
            prop_assert!(out.len() <= input.len());
            prop_assert_eq!(out.first().map(Record::start), input.first().map(Record::start));
            prop_assert_eq!(out.last().map(Record::end), input.last().map(Record::end));
        }
    }
}
