//! Query bucket widths and per-bucket aggregation modes.

use chrono::Duration;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How samples inside one output bucket are reduced to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Weighted mean of all contributions.
    #[default]
    Mean,
    /// Largest value seen in the bucket.
    Max,
    /// Smallest value seen in the bucket.
    Min,
    /// Earliest value in the bucket; later points are dropped.
    First,
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregation::Mean => write!(f, "mean"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::First => write!(f, "first"),
        }
    }
}

impl std::str::FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mean" | "avg" => Ok(Aggregation::Mean),
            "max" => Ok(Aggregation::Max),
            "min" => Ok(Aggregation::Min),
            "first" | "drop" => Ok(Aggregation::First),
            other => Err(Error::Config(format!("unknown aggregation: {other}"))),
        }
    }
}

/// Width of one output bucket in a series query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resolution(Duration);

impl Resolution {
    pub fn five_minutes() -> Self {
        Resolution(Duration::minutes(5))
    }

    pub fn hourly() -> Self {
        Resolution(Duration::hours(1))
    }

    pub fn daily() -> Self {
        Resolution(Duration::days(1))
    }

    /// Calendar-free month: 30 days.
    pub fn monthly() -> Self {
        Resolution(Duration::days(30))
    }

    pub fn new(width: Duration) -> Result<Self> {
        if width <= Duration::zero() {
            return Err(Error::InvalidResolution(format!(
                "width must be positive, got {}s",
                width.num_seconds()
            )));
        }
        Ok(Resolution(width))
    }

    pub fn from_secs(secs: i64) -> Result<Self> {
        Self::new(Duration::seconds(secs))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn as_micros(&self) -> i64 {
        self.0.num_microseconds().unwrap_or(i64::MAX)
    }

    /// Parse `5min`, `h`, `d`, `M`, or `<n><unit>` with unit one of
    /// `s`, `m`, `min`, `h`, `d`. A bare number is seconds.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len());
        let (digits, unit) = input.split_at(split);

        let count: i64 = if digits.is_empty() {
            1
        } else {
            digits
                .parse()
                .map_err(|_| Error::InvalidResolution(input.to_string()))?
        };

        let unit_width = match unit {
            "" if !digits.is_empty() => Duration::seconds(1),
            "s" | "sec" => Duration::seconds(1),
            "m" | "min" => Duration::minutes(1),
            "h" | "H" => Duration::hours(1),
            "d" | "D" => Duration::days(1),
            "M" => Duration::days(30),
            _ => return Err(Error::InvalidResolution(input.to_string())),
        };

        let width = unit_width
            .checked_mul(count.try_into().map_err(|_| Error::InvalidResolution(input.to_string()))?)
            .ok_or_else(|| Error::InvalidResolution(input.to_string()))?;
        Self::new(width)
    }

    /// Lookback windows that make sense at this resolution, shortest first.
    ///
    /// The first entry is used when a query omits its start.
    pub fn recommended_ranges(&self) -> Vec<(&'static str, Duration)> {
        if self.0 <= Duration::minutes(5) {
            vec![
                ("last_day", Duration::days(1)),
                ("last_3_days", Duration::days(3)),
                ("last_week", Duration::days(7)),
            ]
        } else if self.0 <= Duration::hours(1) {
            vec![
                ("last_3_days", Duration::days(3)),
                ("last_week", Duration::days(7)),
                ("last_month", Duration::days(30)),
            ]
        } else if self.0 <= Duration::days(1) {
            vec![
                ("last_month", Duration::days(30)),
                ("last_quarter", Duration::days(90)),
                ("last_year", Duration::days(365)),
            ]
        } else {
            vec![("last_year", Duration::days(365))]
        }
    }

    pub fn default_lookback(&self) -> Duration {
        self.recommended_ranges()
            .first()
            .map(|(_, d)| *d)
            .unwrap_or_else(|| Duration::days(1))
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0.num_seconds();
        if secs % 86_400 == 0 {
            write!(f, "{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}min", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Resolution::parse(s)
    }
}
