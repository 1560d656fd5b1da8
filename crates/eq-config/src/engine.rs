//! Typed engine configuration (`engine.json`).
//!
//! Every section and field has a default, so a partial file (or none at all)
//! yields a usable configuration.

use std::path::{Path, PathBuf};

use chrono::Duration;
use eq_common::{Aggregation, IngestPolicy};
use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// Root of `engine.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// How often the external scheduler samples the source. The engine does
    /// not schedule anything itself; the value only widens the compaction
    /// gap threshold.
    #[serde(default = "default_sampling_cadence")]
    pub sampling_cadence_secs: u64,

    #[serde(default)]
    pub segment: SegmentSettings,

    #[serde(default)]
    pub compaction: CompactionSettings,

    #[serde(default)]
    pub ingest: IngestSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub query: QuerySettings,
}

fn default_schema_version() -> String {
    crate::CONFIG_SCHEMA_VERSION.to_string()
}

fn default_sampling_cadence() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            schema_version: default_schema_version(),
            sampling_cadence_secs: default_sampling_cadence(),
            segment: SegmentSettings::default(),
            compaction: CompactionSettings::default(),
            ingest: IngestSettings::default(),
            retention: RetentionSettings::default(),
            query: QuerySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json)
            .map_err(|e| ValidationError::ParseError(format!("Invalid JSON: {}", e)))
    }

    /// Timestamp tolerances for the observation validator.
    pub fn ingest_policy(&self) -> IngestPolicy {
        IngestPolicy {
            clock_skew_tolerance: Duration::milliseconds(self.ingest.clock_skew_tolerance_ms as i64),
            duplicate_tolerance: Duration::milliseconds(self.ingest.duplicate_tolerance_ms as i64),
        }
    }

    /// Largest spacing between two samples that still belong to one run.
    ///
    /// Never narrower than two sampling periods, so a single late tick does
    /// not split a run.
    pub fn effective_max_sample_gap(&self) -> Duration {
        let floor = self.sampling_cadence_secs.saturating_mul(2);
        Duration::seconds(self.compaction.max_sample_gap_secs.max(floor) as i64)
    }
}

/// When the open segment seals. The first threshold reached wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSettings {
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_records() -> usize {
    1440
}

fn default_max_duration() -> u64 {
    24 * 3600
}

fn default_max_bytes() -> u64 {
    1024 * 1024
}

impl Default for SegmentSettings {
    fn default() -> Self {
        SegmentSettings {
            max_records: default_max_records(),
            max_duration_secs: default_max_duration(),
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionSettings {
    /// Largest difference between a run's first value and a later sample
    /// that still folds into the run. 0 means exact match.
    #[serde(default)]
    pub epsilon: u32,

    /// Runs shorter than this stay as individual samples.
    #[serde(default = "default_min_run_length")]
    pub min_run_length: u64,

    #[serde(default = "default_max_sample_gap")]
    pub max_sample_gap_secs: u64,

    /// Compact sealed segments on a background worker as they seal.
    #[serde(default = "default_true")]
    pub auto_compact: bool,
}

fn default_min_run_length() -> u64 {
    2
}

fn default_max_sample_gap() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

impl Default for CompactionSettings {
    fn default() -> Self {
        CompactionSettings {
            epsilon: 0,
            min_run_length: default_min_run_length(),
            max_sample_gap_secs: default_max_sample_gap(),
            auto_compact: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_clock_skew")]
    pub clock_skew_tolerance_ms: u64,

    #[serde(default)]
    pub duplicate_tolerance_ms: u64,
}

fn default_clock_skew() -> u64 {
    2000
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            clock_skew_tolerance_ms: default_clock_skew(),
            duplicate_tolerance_ms: 0,
        }
    }
}

/// One downsampling step: history older than `older_than_days` is collapsed
/// into buckets of `granularity_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsampleRule {
    pub older_than_days: u32,
    pub granularity_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Raw segments older than this are force-compacted.
    #[serde(default = "default_raw_horizon")]
    pub raw_horizon_days: u32,

    #[serde(default = "default_downsample")]
    pub downsample: Vec<DownsampleRule>,

    /// Hard horizon. `None` keeps history forever.
    #[serde(default = "default_evict")]
    pub evict_older_than_days: Option<u32>,

    /// JSONL file receiving one line per retention event.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

fn default_raw_horizon() -> u32 {
    7
}

fn default_downsample() -> Vec<DownsampleRule> {
    vec![DownsampleRule {
        older_than_days: 30,
        granularity_secs: 86_400,
    }]
}

fn default_evict() -> Option<u32> {
    Some(365)
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            raw_horizon_days: default_raw_horizon(),
            downsample: default_downsample(),
            evict_older_than_days: default_evict(),
            event_log: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default)]
    pub default_aggregation: Aggregation,

    /// Deadline applied to CLI queries. 0 disables it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for QuerySettings {
    fn default() -> Self {
        QuerySettings {
            default_aggregation: Aggregation::Mean,
            timeout_ms: default_timeout_ms(),
        }
    }
}
