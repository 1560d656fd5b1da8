//! Border queue event storage.
//!
//! This crate provides:
//! - A checksummed append log for the open segment
//! - Immutable Parquet segments (raw and compacted tiers)
//! - Run-length compaction of repeated readings
//! - Range reads, bucketed series, wait estimates and activity summaries
//! - Storage accounting, verification and tiered retention

pub mod catalog;
pub mod compactor;
pub mod error;
pub mod ledger;
pub mod log;
pub mod query;
pub mod record;
pub mod retention;
pub mod schema;
pub mod segment;
pub mod store;
mod worker;

pub use catalog::{CatalogSource, QuarantinedSegment};
pub use compactor::{compact, CompactionConfig};
pub use error::{Result, StoreError};
pub use ledger::{Footprint, Ledger, LedgerMismatch};
pub use log::TailDefect;
pub use query::{
    ActivitySummary, CancelToken, FixedThroughput, HourlyThroughput, LongestRun, QueryOptions,
    RangeReader, SeriesIter, SeriesPoint, ThroughputModel, WaitSummary,
};
pub use record::{CompactedRun, GapSpan, Record, Rollup};
pub use retention::{
    DownsampleStep, RetentionAction, RetentionEvent, RetentionPolicy, RetentionReport,
};
pub use segment::{SegmentMeta, SegmentTier};
pub use store::{
    AppendOutcome, CompactionSummary, QueueStore, RecoveryReport, VerifyProblem, VerifyReport,
    MAX_SERIES_BUCKETS,
};
