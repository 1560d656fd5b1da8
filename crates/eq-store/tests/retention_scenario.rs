//! Thirty days of ten-minute samples under a seven-day raw horizon with
//! daily downsampling.

use chrono::{DateTime, Duration, TimeZone, Utc};
use eq_common::RawObservation;
use eq_config::EngineConfig;
use eq_store::{
    DownsampleStep, QueryOptions, QueueStore, Record, RetentionAction, RetentionPolicy,
};
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
}

fn ingest_thirty_days(store: &QueueStore) {
    for i in 0..30 * 144 {
        let ts = t0() + Duration::minutes(10 * i);
        // Changes every half hour so compaction keeps some structure.
        let value = (i / 3) % 9;
        store.append(&RawObservation::sample(ts, value)).unwrap();
    }
}

fn policy(event_log: Option<std::path::PathBuf>) -> RetentionPolicy {
    RetentionPolicy {
        raw_horizon: Duration::days(7),
        downsample: vec![DownsampleStep {
            older_than: Duration::days(7),
            granularity_secs: 86_400,
        }],
        evict_older_than: None,
        event_log,
    }
}

fn store_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.segment.max_records = 144;
    config.compaction.auto_compact = false;
    config
}

#[test]
fn old_history_becomes_daily_rollups() {
    let dir = tempdir().unwrap();
    let events_path = dir.path().join("retention-events.jsonl");
    let (store, _) = QueueStore::open(dir.path().join("data"), &store_config()).unwrap();
    ingest_thirty_days(&store);

    let before = store.footprint();
    assert_eq!(before.raw_segments, 30);
    assert_eq!(before.open_records, 0);

    let now = t0() + Duration::days(30);
    let preview = store.preview_retention(&policy(None), now).unwrap();
    assert!(preview.dry_run);
    assert!(!preview.events.is_empty());
    assert!(preview.events.iter().all(|e| e.dry_run));
    assert_eq!(store.footprint().raw_bytes, before.raw_bytes);

    let report = store
        .enforce_retention(&policy(Some(events_path.clone())), now)
        .unwrap();
    assert!(!report.dry_run);
    assert!(report.footprint_after.raw_bytes < before.raw_bytes);
    assert_eq!(report.footprint_after.raw_segments, 7);
    assert_eq!(report.footprint_after.compacted_segments, 23);
    assert!(report.bytes_freed() > 0);
    // Downsampling folds samples; nothing is evicted.
    assert_eq!(report.footprint_after.observations, before.observations);

    let compacts = report.events.iter().filter(|e| e.action == RetentionAction::Compact).count();
    let downsamples = report
        .events
        .iter()
        .filter(|e| e.action == RetentionAction::Downsample)
        .count();
    assert_eq!(compacts, 23);
    assert_eq!(downsamples, 23);

    let logged = std::fs::read_to_string(&events_path).unwrap();
    assert_eq!(logged.lines().count(), report.events.len());

    let old: Vec<Record> = store
        .read_range(t0(), t0() + Duration::days(22), QueryOptions::default())
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(old.len(), 23);
    for record in &old {
        match record {
            Record::Rollup(rollup) => {
                assert_eq!(rollup.granularity_secs, 86_400);
                assert_eq!(rollup.samples, 144);
                assert_eq!((rollup.min, rollup.max), (0, 8));
            }
            other => panic!("expected a daily rollup, got {:?}", other),
        }
    }

    // Recent history is still raw samples.
    let recent = store
        .read_range(t0() + Duration::days(29), now, QueryOptions::default())
        .unwrap()
        .map(Result::unwrap)
        .filter(|r| matches!(r, Record::Sample(_)))
        .count();
    assert_eq!(recent, 144);

    assert!(store.verify().unwrap().ok);

    // A second pass has nothing left to do.
    let again = store.enforce_retention(&policy(None), now).unwrap();
    assert!(again.events.is_empty());
}

#[test]
fn eviction_drops_history_past_the_hard_horizon() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &store_config()).unwrap();
    ingest_thirty_days(&store);

    let now = t0() + Duration::days(30);
    let policy = RetentionPolicy {
        evict_older_than: Some(Duration::days(20)),
        ..policy(None)
    };
    let report = store.enforce_retention(&policy, now).unwrap();
    assert!(report
        .events
        .iter()
        .any(|e| e.action == RetentionAction::Evict && e.records_after == 0));

    let footprint = store.footprint();
    assert_eq!(footprint.raw_segments + footprint.compacted_segments, 20);
    assert_eq!(footprint.evicted_events, 10 * 144);
    assert_eq!(footprint.observations, 20 * 144);

    let (first, _) = store.time_bounds().unwrap();
    assert_eq!(first, t0() + Duration::days(10));
}
