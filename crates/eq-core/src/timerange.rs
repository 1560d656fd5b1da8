//! Query range parsing for `--from`, `--to` and `--range`.
//!
//! Instants are RFC 3339 or `now`. A range is a lookback such as `24h` or
//! `7d` ending at `--to` (or now). With neither `--from` nor `--range`, or
//! with `--range auto`, the command's default lookback applies.

use chrono::{DateTime, Duration, Utc};
use eq_common::{Error, Resolution};

/// Parse an RFC 3339 timestamp or `now`.
pub fn parse_instant(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("invalid timestamp '{}': {}", input, e)))
}

/// Parse a lookback like `90m`, `24h` or `7d`.
pub fn parse_lookback(input: &str) -> Result<Duration, Error> {
    Resolution::parse(input)
        .map(|r| r.duration())
        .map_err(|_| Error::Config(format!("invalid range '{}'; use e.g. 90m, 24h or 7d", input)))
}

fn lookback_start(end: DateTime<Utc>, lookback: Duration) -> Result<DateTime<Utc>, Error> {
    end.checked_sub_signed(lookback).ok_or(Error::InvalidRange {
        start: DateTime::<Utc>::MIN_UTC,
        end,
    })
}

/// Resolve CLI range options to `[start, end]`.
pub fn resolve_range(
    from: Option<&str>,
    to: Option<&str>,
    range: Option<&str>,
    default_lookback: Duration,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let end = match to {
        Some(to) => parse_instant(to, now)?,
        None => now,
    };
    let start = match (from, range) {
        (Some(_), Some(_)) => {
            return Err(Error::Config("--from and --range are mutually exclusive".into()))
        }
        (Some(from), None) => parse_instant(from, now)?,
        (None, Some(range)) if range.trim().eq_ignore_ascii_case("auto") => {
            lookback_start(end, default_lookback)?
        }
        (None, Some(range)) => lookback_start(end, parse_lookback(range)?)
            .map_err(|_| Error::Config(format!("range '{}' reaches before the earliest supported time", range)))?,
        (None, None) => lookback_start(end, default_lookback)?,
    };
    if start > end {
        return Err(Error::InvalidRange { start, end });
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn explicit_bounds() {
        let (start, end) = resolve_range(
            Some("2026-08-10T10:00:00Z"),
            Some("2026-08-10T11:00:00+00:00"),
            None,
            Duration::days(1),
            now(),
        )
        .unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 10, 10, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 8, 10, 11, 0, 0).unwrap());
    }

    #[test]
    fn lookback_ends_at_now_by_default() {
        let (start, end) = resolve_range(None, None, Some("6h"), Duration::days(1), now()).unwrap();
        assert_eq!(end, now());
        assert_eq!(start, now() - Duration::hours(6));

        let (start, _) = resolve_range(None, None, None, Duration::days(3), now()).unwrap();
        assert_eq!(start, now() - Duration::days(3));

        let (start, _) = resolve_range(None, None, Some("auto"), Duration::days(30), now()).unwrap();
        assert_eq!(start, now() - Duration::days(30));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_instant("yesterday", now()).is_err());
        assert!(parse_lookback("soon").is_err());
        assert!(resolve_range(Some("now"), None, Some("1h"), Duration::days(1), now()).is_err());
        let err = resolve_range(None, None, Some("99999999d"), Duration::days(1), now()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = resolve_range(None, None, None, Duration::MAX, now()).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
        let err = resolve_range(
            Some("2026-08-11T00:00:00Z"),
            Some("2026-08-10T00:00:00Z"),
            None,
            Duration::days(1),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
    }
}
