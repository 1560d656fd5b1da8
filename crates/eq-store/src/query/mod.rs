//! Time-range queries over sealed segments and the open log.
//!
//! Everything here is built on [`RangeReader`], a lazy merge of two ordered
//! streams: sealed segments (loaded one file at a time) and a snapshot of the
//! open log taken when the reader is created. Cancellation and deadlines are
//! checked before each segment load.

pub mod activity;
pub mod series;
pub mod wait;

use std::collections::VecDeque;
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::record::Record;
use crate::segment::SegmentFile;

pub use activity::{ActivitySummary, LongestRun};
pub use series::{SeriesIter, SeriesPoint};
pub use wait::{FixedThroughput, HourlyThroughput, ThroughputModel, WaitSummary};

/// Cooperative cancellation flag shared between a query and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub cancel: Option<CancelToken>,
    pub deadline: Option<Instant>,
    timeout: Option<StdDuration>,
}

impl QueryOptions {
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Abort the query once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.timeout = Some(timeout);
        self
    }

    /// Fail with `Cancelled` or `Timeout` if the query should stop.
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(eq_common::Error::Cancelled.into());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                let millis = self
                    .timeout
                    .map(|t| t.as_millis() as u64)
                    .unwrap_or_default();
                return Err(eq_common::Error::Timeout { millis }.into());
            }
        }
        Ok(())
    }
}

pub(crate) fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start > end {
        return Err(eq_common::Error::InvalidRange { start, end }.into());
    }
    Ok(())
}

/// Number of a span record's observations that fall inside `[from, to]`.
///
/// The `count` observations are taken as evenly spaced from `start` to
/// `end`, both included, so a run cut by the range counts the samples it
/// actually covers and a fully covered run counts exactly `count`.
pub(crate) fn overlap_weight(
    count: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> f64 {
    if count == 0 || end < from || start > to {
        return 0.0;
    }
    let span = (end - start).num_microseconds().unwrap_or(i64::MAX);
    if span <= 0 || count == 1 || (start >= from && end <= to) {
        return count as f64;
    }
    let step = span as f64 / (count - 1) as f64;
    let offset = |t: DateTime<Utc>| (t - start).num_microseconds().unwrap_or(i64::MAX) as f64 / step;
    let last = (count - 1) as f64;
    let first_inside = (offset(from) - 1e-9).ceil().clamp(0.0, last);
    let last_inside = (offset(to) + 1e-9).floor().clamp(0.0, last);
    if last_inside < first_inside {
        0.0
    } else {
        last_inside - first_inside + 1.0
    }
}

/// Lazy, time-ordered view of every record intersecting `[start, end]`.
///
/// Restartable with [`RangeReader::rewind`]; dropping it early has no side
/// effects.
#[derive(Debug)]
pub struct RangeReader {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    segments: Arc<[Arc<SegmentFile>]>,
    open: Arc<[Record]>,
    options: QueryOptions,
    cursor: Cursor,
}

#[derive(Debug)]
struct Cursor {
    pending: VecDeque<Arc<SegmentFile>>,
    loaded: std::vec::IntoIter<Record>,
    sealed_head: Option<Record>,
    open: Peekable<std::vec::IntoIter<Record>>,
    /// Last record seen that ended before the range.
    lead: Option<Record>,
    finished: bool,
}

impl RangeReader {
    pub(crate) fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        segments: Vec<Arc<SegmentFile>>,
        open: Vec<Record>,
        options: QueryOptions,
    ) -> Self {
        let segments: Arc<[Arc<SegmentFile>]> = segments.into();
        let open: Arc<[Record]> = open.into();
        let cursor = Cursor::new(&segments, &open);
        RangeReader {
            start,
            end,
            segments,
            open,
            options,
            cursor,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Start over from the first record.
    pub fn rewind(&mut self) {
        self.cursor = Cursor::new(&self.segments, &self.open);
    }

    /// The last record ending before the range start, among the records
    /// consumed so far. Final once the first in-range record was returned.
    pub fn lead(&self) -> Option<Record> {
        self.cursor.lead
    }

    fn note_lead(&mut self, record: Record) {
        if self.cursor.lead.map_or(true, |lead| record.end() >= lead.end()) {
            self.cursor.lead = Some(record);
        }
    }

    fn fill_sealed_head(&mut self) -> Result<()> {
        while self.cursor.sealed_head.is_none() {
            if let Some(record) = self.cursor.loaded.next() {
                if record.end() < self.start {
                    self.note_lead(record);
                } else if record.start() <= self.end {
                    self.cursor.sealed_head = Some(record);
                }
                continue;
            }
            let Some(segment) = self.cursor.pending.pop_front() else {
                return Ok(());
            };
            self.options.check()?;
            self.cursor.loaded = segment.read_records()?.into_iter();
        }
        Ok(())
    }

    fn next_open(&mut self) -> Option<Record> {
        while let Some(record) = self.cursor.open.next() {
            if record.end() < self.start {
                self.note_lead(record);
            } else if record.start() <= self.end {
                return Some(record);
            }
        }
        None
    }
}

impl Cursor {
    fn new(segments: &Arc<[Arc<SegmentFile>]>, open: &Arc<[Record]>) -> Self {
        Cursor {
            pending: segments.iter().cloned().collect(),
            loaded: Vec::new().into_iter(),
            sealed_head: None,
            open: open.to_vec().into_iter().peekable(),
            lead: None,
            finished: false,
        }
    }
}

impl Iterator for RangeReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.finished {
            return None;
        }
        if let Err(e) = self.fill_sealed_head() {
            self.cursor.finished = true;
            return Some(Err(e));
        }

        // Open-log records that end before the range only update the lead.
        while let Some(peeked) = self.cursor.open.peek() {
            if peeked.end() >= self.start {
                break;
            }
            if let Some(record) = self.cursor.open.next() {
                self.note_lead(record);
            }
        }

        let take_open = match (&self.cursor.sealed_head, self.cursor.open.peek()) {
            (Some(sealed), Some(open)) => open.start() < sealed.start(),
            (None, Some(_)) => true,
            (_, None) => false,
        };
        let next = if take_open {
            self.next_open()
        } else {
            self.cursor.sealed_head.take()
        };
        if next.is_none() {
            self.cursor.finished = true;
        }
        next.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{write_segment, SegmentTier};
    use chrono::{Duration, TimeZone};
    use eq_common::Observation;
    use tempfile::tempdir;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn sample(minute: i64, value: u32) -> Record {
        Record::Sample(Observation::new(at(minute), value))
    }

    fn segment(dir: &std::path::Path, id: u64, records: &[Record]) -> Arc<SegmentFile> {
        let meta = write_segment(dir, SegmentTier::Raw, id, 0, records).unwrap();
        Arc::new(SegmentFile::new(dir, meta))
    }

    #[test]
    fn merges_segments_and_open_snapshot_in_order() {
        let dir = tempdir().unwrap();
        let a = segment(dir.path(), 0, &[sample(0, 1), sample(1, 2)]);
        let b = segment(dir.path(), 1, &[sample(2, 3), sample(3, 4)]);
        let open = vec![sample(4, 5), sample(5, 6)];

        let mut reader = RangeReader::new(at(1), at(4), vec![a, b], open, QueryOptions::default());
        let values: Vec<u32> = reader
            .by_ref()
            .map(|r| match r.unwrap() {
                Record::Sample(o) => o.queue_length,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(values, vec![2, 3, 4, 5]);
        assert_eq!(reader.lead(), Some(sample(0, 1)));

        reader.rewind();
        assert_eq!(reader.count(), 4);
    }

    #[test]
    fn cancellation_stops_between_segments() {
        let dir = tempdir().unwrap();
        let a = segment(dir.path(), 0, &[sample(0, 1)]);
        let token = CancelToken::new();
        token.cancel();
        let options = QueryOptions::default().with_cancel(token);

        let mut reader = RangeReader::new(at(0), at(10), vec![a], Vec::new(), options);
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.is_interrupted());
        assert!(reader.next().is_none());
    }

    #[test]
    fn expired_deadline_is_timeout() {
        let options = QueryOptions::default().with_timeout(StdDuration::from_millis(0));
        let err = options.check().unwrap_err();
        assert_eq!(err.code(), 33);
    }

    #[test]
    fn overlap_weight_counts_covered_samples() {
        // 20 samples one minute apart, cut in the middle.
        assert_eq!(overlap_weight(20, at(0), at(19), at(10), at(30)), 10.0);
        assert_eq!(overlap_weight(20, at(0), at(19), at(0), at(9)), 10.0);
        // Both cut edges land between samples.
        assert_eq!(overlap_weight(3, at(0), at(10), at(2), at(8)), 1.0);
        assert_eq!(overlap_weight(3, at(0), at(10), at(1), at(4)), 0.0);
        assert_eq!(overlap_weight(3, at(2), at(2), at(0), at(5)), 3.0);
        assert_eq!(overlap_weight(3, at(6), at(9), at(0), at(5)), 0.0);
    }
}
