//! Observation model: the typed "queue state at time T" record and its
//! validation rules.
//!
//! A scraper hands the engine a [`RawObservation`] with loosely typed values.
//! [`validate`] turns it into a [`Validated`] candidate or rejects it:
//!
//! - a failed fetch becomes a gap marker, never a zero-length sample
//! - negative or out-of-range counters are rejected
//! - a timestamp behind the last accepted entry is clamped when the skew is
//!   within tolerance and rejected otherwise
//! - a timestamp within the duplicate tolerance of the last entry is flagged
//!   so the store can merge or refuse it

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One sample as reported by the scraper, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObservation {
    /// Wall-clock time of the fetch (UTC).
    pub timestamp: DateTime<Utc>,

    /// Reported number of vehicles in the queue.
    #[serde(default)]
    pub queue_length: i64,

    /// Number of open lanes, when the source exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_count: Option<i64>,

    /// HTTP-ish status of the fetch that produced this sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// False when the fetch failed and the counters are meaningless.
    #[serde(default = "default_fetch_ok")]
    pub fetch_ok: bool,
}

fn default_fetch_ok() -> bool {
    true
}

impl RawObservation {
    /// A successful fetch reporting `queue_length` vehicles.
    pub fn sample(timestamp: DateTime<Utc>, queue_length: i64) -> Self {
        RawObservation {
            timestamp,
            queue_length,
            lane_count: None,
            status_code: None,
            fetch_ok: true,
        }
    }

    /// A failed fetch at `timestamp`.
    pub fn failed(timestamp: DateTime<Utc>) -> Self {
        RawObservation {
            timestamp,
            queue_length: 0,
            lane_count: None,
            status_code: None,
            fetch_ok: false,
        }
    }

    pub fn with_lanes(mut self, lanes: i64) -> Self {
        self.lane_count = Some(lanes);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

/// A validated, immutable queue sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub queue_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_count: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, queue_length: u32) -> Self {
        Observation {
            timestamp,
            queue_length,
            lane_count: None,
            status_code: None,
        }
    }

    /// Whether two samples carry the same counters, ignoring the timestamp.
    pub fn same_reading(&self, other: &Observation) -> bool {
        self.queue_length == other.queue_length
            && self.lane_count == other.lane_count
            && self.status_code == other.status_code
    }
}

/// What a validated raw observation turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Sample(Observation),
    /// A failed fetch at the given instant.
    Gap(DateTime<Utc>),
}

impl Candidate {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Candidate::Sample(obs) => obs.timestamp,
            Candidate::Gap(ts) => *ts,
        }
    }

    fn with_timestamp(self, timestamp: DateTime<Utc>) -> Self {
        match self {
            Candidate::Sample(obs) => Candidate::Sample(Observation { timestamp, ..obs }),
            Candidate::Gap(_) => Candidate::Gap(timestamp),
        }
    }

    /// Short description used in duplicate diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Candidate::Sample(obs) => format!("queue_length={}", obs.queue_length),
            Candidate::Gap(_) => "gap".to_string(),
        }
    }
}

/// How the candidate relates to the last accepted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Strictly after the last entry.
    Fresh,
    /// Within the duplicate tolerance of the last entry.
    Duplicate,
    /// Slightly behind the last entry; moved forward by one microsecond past it.
    Clamped { original: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validated {
    pub candidate: Candidate,
    pub disposition: Disposition,
}

/// Tolerances applied while validating timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestPolicy {
    /// Backward skew accepted (and clamped) before a sample is rejected.
    pub clock_skew_tolerance: Duration,
    /// Distance at which two timestamps count as the same instant.
    pub duplicate_tolerance: Duration,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        IngestPolicy {
            clock_skew_tolerance: Duration::seconds(2),
            duplicate_tolerance: Duration::zero(),
        }
    }
}

/// Validate `raw` against the last accepted timestamp.
pub fn validate(
    raw: &RawObservation,
    last: Option<DateTime<Utc>>,
    policy: &IngestPolicy,
) -> Result<Validated> {
    let candidate = if raw.fetch_ok {
        Candidate::Sample(check_counters(raw)?)
    } else {
        Candidate::Gap(raw.timestamp)
    };

    let Some(last) = last else {
        return Ok(Validated {
            candidate,
            disposition: Disposition::Fresh,
        });
    };

    let delta = raw.timestamp - last;
    if delta.abs() <= policy.duplicate_tolerance {
        return Ok(Validated {
            candidate,
            disposition: Disposition::Duplicate,
        });
    }
    if delta > Duration::zero() {
        return Ok(Validated {
            candidate,
            disposition: Disposition::Fresh,
        });
    }

    let skew = -delta;
    if skew <= policy.clock_skew_tolerance {
        let clamped = last + Duration::microseconds(1);
        return Ok(Validated {
            candidate: candidate.with_timestamp(clamped),
            disposition: Disposition::Clamped {
                original: raw.timestamp,
            },
        });
    }

    Err(Error::InvalidObservation(format!(
        "timestamp {} is {}ms behind last accepted {} (tolerance {}ms)",
        raw.timestamp.to_rfc3339(),
        skew.num_milliseconds(),
        last.to_rfc3339(),
        policy.clock_skew_tolerance.num_milliseconds()
    )))
}

fn check_counters(raw: &RawObservation) -> Result<Observation> {
    let queue_length = u32::try_from(raw.queue_length).map_err(|_| {
        Error::InvalidObservation(format!(
            "queue_length {} is outside 0..={}",
            raw.queue_length,
            u32::MAX
        ))
    })?;

    let lane_count = match raw.lane_count {
        None => None,
        Some(lanes) => Some(u16::try_from(lanes).map_err(|_| {
            Error::InvalidObservation(format!("lane_count {} is outside 0..={}", lanes, u16::MAX))
        })?),
    };

    Ok(Observation {
        timestamp: raw.timestamp,
        queue_length,
        lane_count,
        status_code: raw.status_code,
    })
}
