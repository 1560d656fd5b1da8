//! Arrow schema shared by raw and compacted segment files.
//!
//! Every record kind maps onto one row; columns that do not apply to a kind
//! are null.
//!
//! | column           | sample | gap   | run   | rollup |
//! |------------------|--------|-------|-------|--------|
//! | kind             | 0      | 1     | 2     | 3      |
//! | start / end      | ts     | span  | span  | span   |
//! | value            | len    |       | value |        |
//! | min / max        |        |       | yes   | yes    |
//! | mean             |        |       |       | yes    |
//! | count            | 1      | fails | count | samples|
//! | gap_count        |        |       |       | gaps   |
//! | lane_count       | opt    |       | opt   |        |
//! | status_code      | opt    |       |       |        |
//! | granularity_secs |        |       |       | yes    |

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, RecordBatch, TimestampMicrosecondArray, UInt16Array,
    UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use eq_common::Observation;

use crate::error::{Result, StoreError};
use crate::record::{CompactedRun, GapSpan, Record, Rollup};

const KIND_SAMPLE: u8 = 0;
const KIND_GAP: u8 = 1;
const KIND_RUN: u8 = 2;
const KIND_ROLLUP: u8 = 3;

/// Helper to create a timestamp field (microseconds UTC).
fn timestamp_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    )
}

/// Schema for `segment-*.parquet` files.
pub fn segment_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("kind", DataType::UInt8, false),
        timestamp_field("start"),
        timestamp_field("end"),
        Field::new("value", DataType::UInt32, true),
        Field::new("min", DataType::UInt32, true),
        Field::new("max", DataType::UInt32, true),
        Field::new("mean", DataType::Float64, true),
        Field::new("count", DataType::UInt64, false),
        Field::new("gap_count", DataType::UInt64, true),
        Field::new("lane_count", DataType::UInt16, true),
        Field::new("status_code", DataType::UInt16, true),
        Field::new("granularity_secs", DataType::UInt32, true),
    ]))
}

#[derive(Default)]
struct Columns {
    kind: Vec<u8>,
    start: Vec<i64>,
    end: Vec<i64>,
    value: Vec<Option<u32>>,
    min: Vec<Option<u32>>,
    max: Vec<Option<u32>>,
    mean: Vec<Option<f64>>,
    count: Vec<u64>,
    gap_count: Vec<Option<u64>>,
    lane_count: Vec<Option<u16>>,
    status_code: Vec<Option<u16>>,
    granularity: Vec<Option<u32>>,
}

impl Columns {
    fn with_capacity(n: usize) -> Self {
        Columns {
            kind: Vec::with_capacity(n),
            start: Vec::with_capacity(n),
            end: Vec::with_capacity(n),
            value: Vec::with_capacity(n),
            min: Vec::with_capacity(n),
            max: Vec::with_capacity(n),
            mean: Vec::with_capacity(n),
            count: Vec::with_capacity(n),
            gap_count: Vec::with_capacity(n),
            lane_count: Vec::with_capacity(n),
            status_code: Vec::with_capacity(n),
            granularity: Vec::with_capacity(n),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_row(
        &mut self,
        kind: u8,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        value: Option<u32>,
        min_max: Option<(u32, u32)>,
        mean: Option<f64>,
        count: u64,
        gap_count: Option<u64>,
        lane_count: Option<u16>,
        status_code: Option<u16>,
        granularity: Option<u32>,
    ) {
        self.kind.push(kind);
        self.start.push(start.timestamp_micros());
        self.end.push(end.timestamp_micros());
        self.value.push(value);
        self.min.push(min_max.map(|(lo, _)| lo));
        self.max.push(min_max.map(|(_, hi)| hi));
        self.mean.push(mean);
        self.count.push(count);
        self.gap_count.push(gap_count);
        self.lane_count.push(lane_count);
        self.status_code.push(status_code);
        self.granularity.push(granularity);
    }

    fn push(&mut self, record: &Record) {
        match record {
            Record::Sample(o) => self.push_row(
                KIND_SAMPLE,
                o.timestamp,
                o.timestamp,
                Some(o.queue_length),
                None,
                None,
                1,
                None,
                o.lane_count,
                o.status_code,
                None,
            ),
            Record::Gap(g) => self.push_row(
                KIND_GAP, g.start, g.end, None, None, None, g.count, None, None, None, None,
            ),
            Record::Run(r) => self.push_row(
                KIND_RUN,
                r.start,
                r.end,
                Some(r.value),
                Some((r.min, r.max)),
                None,
                r.count,
                None,
                r.lane_count,
                None,
                None,
            ),
            Record::Rollup(r) => self.push_row(
                KIND_ROLLUP,
                r.start,
                r.end,
                None,
                Some((r.min, r.max)),
                Some(r.mean),
                r.samples,
                Some(r.gaps),
                None,
                None,
                Some(r.granularity_secs),
            ),
        }
    }

    fn into_batch(self) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt8Array::from(self.kind)),
            Arc::new(TimestampMicrosecondArray::from(self.start).with_timezone("UTC")),
            Arc::new(TimestampMicrosecondArray::from(self.end).with_timezone("UTC")),
            Arc::new(UInt32Array::from(self.value)),
            Arc::new(UInt32Array::from(self.min)),
            Arc::new(UInt32Array::from(self.max)),
            Arc::new(Float64Array::from(self.mean)),
            Arc::new(UInt64Array::from(self.count)),
            Arc::new(UInt64Array::from(self.gap_count)),
            Arc::new(UInt16Array::from(self.lane_count)),
            Arc::new(UInt16Array::from(self.status_code)),
            Arc::new(UInt32Array::from(self.granularity)),
        ];
        Ok(RecordBatch::try_new(segment_schema(), columns)?)
    }
}

/// Convert time-ordered records into one record batch.
pub fn records_to_batch(records: &[Record]) -> Result<RecordBatch> {
    let mut columns = Columns::with_capacity(records.len());
    for record in records {
        columns.push(record);
    }
    columns.into_batch()
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| corrupt(format!("column '{}' missing or mistyped", name)))
}

fn opt<T: arrow::datatypes::ArrowPrimitiveType>(
    array: &arrow::array::PrimitiveArray<T>,
    row: usize,
) -> Option<T::Native> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

fn ts(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        StoreError::Engine(eq_common::Error::CorruptSegment {
            path: String::new(),
            reason: format!("timestamp {} out of range", micros),
        })
    })
}

fn corrupt(reason: String) -> StoreError {
    StoreError::Engine(eq_common::Error::CorruptSegment {
        path: String::new(),
        reason,
    })
}

/// Convert a record batch read from a segment file back into records.
pub fn batch_to_records(batch: &RecordBatch, out: &mut Vec<Record>) -> Result<()> {
    let kind = column::<UInt8Array>(batch, "kind")?;
    let start = column::<TimestampMicrosecondArray>(batch, "start")?;
    let end = column::<TimestampMicrosecondArray>(batch, "end")?;
    let value = column::<UInt32Array>(batch, "value")?;
    let min = column::<UInt32Array>(batch, "min")?;
    let max = column::<UInt32Array>(batch, "max")?;
    let mean = column::<Float64Array>(batch, "mean")?;
    let count = column::<UInt64Array>(batch, "count")?;
    let gap_count = column::<UInt64Array>(batch, "gap_count")?;
    let lane_count = column::<UInt16Array>(batch, "lane_count")?;
    let status_code = column::<UInt16Array>(batch, "status_code")?;
    let granularity = column::<UInt32Array>(batch, "granularity_secs")?;

    out.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        let start_ts = ts(start.value(row))?;
        let end_ts = ts(end.value(row))?;
        let missing = |field: &str| corrupt(format!("row {} ({}) lacks {}", row, kind.value(row), field));

        let record = match kind.value(row) {
            KIND_SAMPLE => Record::Sample(Observation {
                timestamp: start_ts,
                queue_length: opt(value, row).ok_or_else(|| missing("value"))?,
                lane_count: opt(lane_count, row),
                status_code: opt(status_code, row),
            }),
            KIND_GAP => Record::Gap(GapSpan {
                start: start_ts,
                end: end_ts,
                count: count.value(row),
            }),
            KIND_RUN => Record::Run(CompactedRun {
                start: start_ts,
                end: end_ts,
                value: opt(value, row).ok_or_else(|| missing("value"))?,
                min: opt(min, row).ok_or_else(|| missing("min"))?,
                max: opt(max, row).ok_or_else(|| missing("max"))?,
                count: count.value(row),
                lane_count: opt(lane_count, row),
            }),
            KIND_ROLLUP => Record::Rollup(Rollup {
                start: start_ts,
                end: end_ts,
                granularity_secs: opt(granularity, row).ok_or_else(|| missing("granularity_secs"))?,
                min: opt(min, row).ok_or_else(|| missing("min"))?,
                max: opt(max, row).ok_or_else(|| missing("max"))?,
                mean: opt(mean, row).ok_or_else(|| missing("mean"))?,
                samples: count.value(row),
                gaps: opt(gap_count, row).unwrap_or(0),
            }),
            other => return Err(corrupt(format!("row {} has unknown kind {}", row, other))),
        };
        out.push(record);
    }
    Ok(())
}
