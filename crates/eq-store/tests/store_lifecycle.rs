//! End-to-end behaviour of the queue store against a temporary data
//! directory: ingestion, sealing, compaction, queries and restart recovery.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Barrier;

use chrono::{DateTime, Duration, TimeZone, Utc};
use eq_common::{Aggregation, Candidate, Observation, RawObservation, Resolution};
use eq_config::EngineConfig;
use eq_store::log::encode_frame;
use eq_store::segment::segment_file_name;
use eq_store::{
    AppendOutcome, CancelToken, CatalogSource, FixedThroughput, QueryOptions, QueueStore, Record,
    SegmentTier, StoreError, TailDefect,
};
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
}

fn minute(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

fn config(max_records: usize, auto_compact: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.segment.max_records = max_records;
    config.compaction.auto_compact = auto_compact;
    config
}

/// Expand stored records back into one value per observation.
fn values(store: &QueueStore, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<u32> {
    let mut out = Vec::new();
    for record in store.read_range(from, to, QueryOptions::default()).unwrap() {
        match record.unwrap() {
            Record::Sample(obs) => out.push(obs.queue_length),
            Record::Run(run) => out.extend(std::iter::repeat(run.value).take(run.count as usize)),
            other => panic!("unexpected record {:?}", other),
        }
    }
    out
}

#[test]
fn round_trip_across_open_raw_and_compacted_tiers() {
    let dir = tempdir().unwrap();
    let (store, report) = QueueStore::open(dir.path(), &config(20, false)).unwrap();
    assert!(report.is_clean());

    let expected: Vec<u32> = (0..65).map(|i| i / 3).collect();
    for (i, value) in expected.iter().enumerate() {
        let outcome = store
            .append(&RawObservation::sample(minute(i as i64), *value as i64))
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Committed { timestamp: minute(i as i64) });
    }

    let detailed = store.footprint_detailed();
    let segments = detailed.segments.unwrap();
    assert_eq!(segments.len(), 3);
    assert_eq!(detailed.open_records, 5);

    let compacted = store.compact_segment(segments[0].id).unwrap().unwrap();
    assert_eq!(compacted.tier, SegmentTier::Compacted);
    assert!(compacted.records < segments[0].records);

    assert_eq!(values(&store, minute(0), minute(64)), expected);
    // Runs are returned whole, so slice on run boundaries.
    assert_eq!(values(&store, minute(9), minute(32)), expected[9..=32].to_vec());
    assert!(store.verify().unwrap().ok);
}

#[test]
fn step_series_at_ten_minutes() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(25, false)).unwrap();
    for i in 0..100 {
        let value = if (40..70).contains(&i) { 12 } else { 5 };
        store.append(&RawObservation::sample(minute(i), value)).unwrap();
    }

    let resolution = Resolution::from_secs(600).unwrap();
    let series = |store: &QueueStore| -> Vec<Option<u32>> {
        store
            .series(minute(0), minute(99), resolution, Aggregation::Mean, QueryOptions::default())
            .unwrap()
            .map(|p| p.unwrap().value.map(|v| v.round() as u32))
            .collect()
    };
    let expected: Vec<Option<u32>> = [5, 5, 5, 5, 12, 12, 12, 5, 5, 5].into_iter().map(Some).collect();

    assert_eq!(series(&store), expected);
    let summary = store.compact_pending().unwrap();
    assert_eq!(summary.segments, 4);
    assert!(summary.records_after < summary.records_before);
    assert_eq!(series(&store), expected);
}

#[test]
fn recorded_gap_is_never_interpolated() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(1440, false)).unwrap();
    for i in 0..30 {
        let raw = match i {
            0..=9 => RawObservation::sample(minute(i), 5),
            10..=19 => RawObservation::failed(minute(i)),
            _ => RawObservation::sample(minute(i), 7),
        };
        let outcome = store.append(&raw).unwrap();
        if (10..=19).contains(&i) {
            assert_eq!(outcome, AppendOutcome::GapRecorded { timestamp: minute(i) });
        }
    }

    let points: Vec<_> = store
        .series(
            minute(0),
            minute(29),
            Resolution::from_secs(600).unwrap(),
            Aggregation::Max,
            QueryOptions::default(),
        )
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(points.len(), 3);
    assert_eq!(points[0].value, Some(5.0));
    assert_eq!(points[1].value, None);
    assert_eq!(points[1].gaps, 10);
    assert_eq!(points[2].value, Some(7.0));

    let activity = store.activity_summary(minute(0), minute(29), QueryOptions::default()).unwrap();
    assert_eq!(activity.gap_count, 10);
    assert_eq!(activity.gap_periods, 1);
    assert_eq!(activity.observations, 20);
}

#[test]
fn reingesting_the_same_observation_changes_nothing() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(1440, false)).unwrap();
    let raw = RawObservation::sample(minute(0), 9).with_lanes(3);
    store.append(&raw).unwrap();
    let before = store.footprint();

    assert_eq!(store.append(&raw).unwrap(), AppendOutcome::Merged { timestamp: minute(0) });
    let after = store.footprint();
    assert_eq!(after.total_bytes, before.total_bytes);
    assert_eq!(after.events, before.events);
    assert_eq!(after.merged_duplicates, 1);
    assert_eq!(values(&store, minute(0), minute(1)), vec![9]);
}

#[test]
fn conflicting_duplicate_is_refused() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(1440, false)).unwrap();
    store.append(&RawObservation::sample(minute(0), 5)).unwrap();

    let err = store.append(&RawObservation::sample(minute(0), 6)).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Engine(eq_common::Error::AmbiguousDuplicate { .. })
    ));
    assert_eq!(values(&store, minute(0), minute(1)), vec![5]);
}

#[test]
fn slightly_late_timestamp_is_clamped() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(1440, false)).unwrap();
    store.append(&RawObservation::sample(minute(1), 5)).unwrap();

    let late = minute(1) - Duration::milliseconds(500);
    match store.append(&RawObservation::sample(late, 6)).unwrap() {
        AppendOutcome::Clamped { timestamp, original } => {
            assert_eq!(original, late);
            assert!(timestamp > minute(1));
        }
        other => panic!("expected clamp, got {:?}", other),
    }
    assert!(store.append(&RawObservation::sample(minute(0), 6)).is_err());
}

#[test]
fn restart_recovers_sealed_segments_and_complete_open_entries() {
    let dir = tempdir().unwrap();
    {
        let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
        for i in 0..25 {
            store.append(&RawObservation::sample(minute(i), i)).unwrap();
        }
    }

    // A frame cut short by a crash: length prefix claims more than follows.
    let mut log = OpenOptions::new().append(true).open(dir.path().join("open.log")).unwrap();
    log.write_all(&[18, 0, 0, 0, 1, 2]).unwrap();
    drop(log);

    let (store, report) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    assert_eq!(report.catalog_source, CatalogSource::Metadata);
    assert_eq!(report.segments, 2);
    assert_eq!(report.open_entries, 5);
    assert_eq!(report.log_defect, Some(TailDefect::Torn));
    assert_eq!(report.log_discarded_bytes, 6);

    let expected: Vec<u32> = (0..25).collect();
    assert_eq!(values(&store, minute(0), minute(24)), expected);

    // Ingestion continues after the recovered tail.
    store.append(&RawObservation::sample(minute(25), 25)).unwrap();
    assert!(store.verify().unwrap().ok);
}

#[test]
fn missing_metadata_is_rebuilt_by_rescan() {
    let dir = tempdir().unwrap();
    {
        let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
        for i in 0..23 {
            store.append(&RawObservation::sample(minute(i), 1)).unwrap();
        }
    }
    std::fs::remove_file(dir.path().join("meta.json")).unwrap();

    let (store, report) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    assert_eq!(report.catalog_source, CatalogSource::Rescan);
    assert_eq!(report.segments, 2);
    assert_eq!(report.open_entries, 3);
    assert_eq!(store.footprint().observations, 23);
    assert!(store.verify().unwrap().ok);
}

#[test]
fn background_worker_compacts_sealed_segments() {
    let dir = tempdir().unwrap();
    {
        let (store, _) = QueueStore::open(dir.path(), &config(10, true)).unwrap();
        for i in 0..30 {
            store.append(&RawObservation::sample(minute(i), 4)).unwrap();
        }
        // Dropping the store drains the worker's queue.
    }

    let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    let footprint = store.footprint();
    assert_eq!(footprint.raw_segments, 0);
    assert_eq!(footprint.compacted_segments, 3);
    assert_eq!(footprint.compacted_records, 3);
    assert_eq!(footprint.observations, 30);
    assert_eq!(values(&store, minute(0), minute(29)), vec![4; 30]);
}

#[test]
fn cancelled_query_stops_before_reading_segments() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    for i in 0..20 {
        store.append(&RawObservation::sample(minute(i), 2)).unwrap();
    }

    let token = CancelToken::new();
    token.cancel();
    let options = QueryOptions::default().with_cancel(token);
    let first = store
        .read_range(minute(0), minute(19), options.clone())
        .unwrap()
        .next()
        .unwrap();
    assert!(matches!(first, Err(StoreError::Engine(eq_common::Error::Cancelled))));

    let model = FixedThroughput { vehicles_per_hour: 60.0 };
    let err = store.estimate_wait(minute(0), minute(19), &model, options).unwrap_err();
    assert!(matches!(err, StoreError::Engine(eq_common::Error::Cancelled)));
}

#[test]
fn inverted_range_is_rejected() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    let err = store.read_range(minute(5), minute(1), QueryOptions::default()).unwrap_err();
    assert!(matches!(err, StoreError::Engine(eq_common::Error::InvalidRange { .. })));
}

#[test]
fn wait_estimate_over_stored_history() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    for i in 0..20 {
        store.append(&RawObservation::sample(minute(i), 30)).unwrap();
    }
    store.compact_pending().unwrap();

    let model = FixedThroughput { vehicles_per_hour: 120.0 };
    let summary = store
        .estimate_wait(minute(0), minute(19), &model, QueryOptions::default())
        .unwrap();
    assert_eq!(summary.samples, 20);
    assert_eq!(summary.min, Some(900.0));
    assert_eq!(summary.max, Some(900.0));
}

#[test]
fn range_cutting_a_run_counts_the_same_before_and_after_compaction() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(20, false)).unwrap();
    for i in 0..20 {
        store.append(&RawObservation::sample(minute(i), 5)).unwrap();
    }
    assert_eq!(store.footprint().raw_segments, 1);

    let model = FixedThroughput { vehicles_per_hour: 60.0 };
    let measure = |store: &QueueStore| {
        let activity = store
            .activity_summary(minute(10), minute(30), QueryOptions::default())
            .unwrap();
        let wait = store
            .estimate_wait(minute(10), minute(30), &model, QueryOptions::default())
            .unwrap();
        let samples: u64 = store
            .series(
                minute(10),
                minute(30),
                Resolution::from_secs(600).unwrap(),
                Aggregation::Mean,
                QueryOptions::default(),
            )
            .unwrap()
            .map(|p| p.unwrap().samples)
            .sum();
        (activity.observations, activity.regimes, wait.samples, samples)
    };

    let before = measure(&store);
    assert_eq!(before.0, 10);
    assert_eq!(before.1.get(&5), Some(&10));
    assert_eq!(before.2, 10);
    assert_eq!(before.3, 10);

    assert_eq!(store.compact_pending().unwrap().segments, 1);
    assert_eq!(store.footprint().compacted_records, 1);
    assert_eq!(measure(&store), before);
}

#[test]
fn replaying_recent_entries_merges_instead_of_clamping() {
    let second = |s: i64| t0() + Duration::seconds(s);
    // Everything open, then everything already sealed.
    for max_records in [1440, 2] {
        let dir = tempdir().unwrap();
        let (store, _) = QueueStore::open(dir.path(), &config(max_records, false)).unwrap();
        let a = RawObservation::sample(second(0), 5);
        let b = RawObservation::sample(second(1), 6);
        store.append(&a).unwrap();
        store.append(&b).unwrap();
        let before = store.footprint();

        assert_eq!(store.append(&a).unwrap(), AppendOutcome::Merged { timestamp: second(0) });
        assert_eq!(store.append(&b).unwrap(), AppendOutcome::Merged { timestamp: second(1) });
        let err = store.append(&RawObservation::sample(second(0), 9)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Engine(eq_common::Error::AmbiguousDuplicate { .. })
        ));

        let after = store.footprint();
        assert_eq!(after.events, before.events);
        assert_eq!(after.total_bytes - after.index_bytes, before.total_bytes - before.index_bytes);
        let stored = store
            .read_range(second(0), second(2), QueryOptions::default())
            .unwrap()
            .count();
        assert_eq!(stored, 2);

        // A late reading at a new instant is still clamped.
        let late = second(1) - Duration::milliseconds(500);
        assert!(matches!(
            store.append(&RawObservation::sample(late, 7)).unwrap(),
            AppendOutcome::Clamped { .. }
        ));
    }
}

#[test]
fn already_sealed_log_entries_are_dropped_on_restart() {
    let dir = tempdir().unwrap();
    {
        let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
        for i in 0..13 {
            store.append(&RawObservation::sample(minute(i), i)).unwrap();
        }
    }

    // The log as left by a crash between sealing and truncating: the tail of
    // the sealed segment followed by the open entries.
    let frames: Vec<u8> = (8..13)
        .map(|i| Candidate::Sample(Observation::new(minute(i), i as u32)))
        .flat_map(|c| encode_frame(&c))
        .collect();
    std::fs::write(dir.path().join("open.log"), frames).unwrap();

    let (store, report) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    assert_eq!(report.skipped_sealed_entries, 2);
    assert_eq!(report.open_entries, 3);
    assert!(!dir.path().join("open.log.tmp").exists());
    assert_eq!(values(&store, minute(0), minute(12)), (0..13).collect::<Vec<u32>>());
    assert!(store.verify().unwrap().ok);
    drop(store);

    let (store, report) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.open_entries, 3);
    assert_eq!(store.footprint().observations, 13);
}

#[test]
fn clean_reopen_leaves_metadata_untouched() {
    let dir = tempdir().unwrap();
    {
        let (store, _) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
        for i in 0..15 {
            store.append(&RawObservation::sample(minute(i), 3)).unwrap();
        }
    }
    let meta = dir.path().join("meta.json");
    let written = std::fs::metadata(&meta).unwrap().modified().unwrap();
    let body = std::fs::read(&meta).unwrap();

    let (store, report) = QueueStore::open(dir.path(), &config(10, false)).unwrap();
    assert_eq!(report.catalog_source, CatalogSource::Metadata);
    store.series(
        minute(0),
        minute(14),
        Resolution::from_secs(600).unwrap(),
        Aggregation::Max,
        QueryOptions::default(),
    )
    .unwrap()
    .for_each(|p| assert!(p.is_ok()));
    assert_eq!(store.footprint().index_bytes, body.len() as u64);
    assert!(store.verify().unwrap().ok);
    drop(store);

    assert_eq!(std::fs::read(&meta).unwrap(), body);
    assert_eq!(std::fs::metadata(&meta).unwrap().modified().unwrap(), written);
}

#[test]
fn readers_keep_their_view_across_seal_and_compaction() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(1440, false)).unwrap();
    for i in 0..30 {
        store.append(&RawObservation::sample(minute(i), (i / 5) as i64)).unwrap();
    }
    let expected: Vec<u32> = (0..30).map(|i| i / 5).collect();

    // Created while everything is still in the open buffer.
    let from_open = store.read_range(minute(0), minute(29), QueryOptions::default()).unwrap();
    let id = store.force_seal().unwrap().unwrap();

    // Created while the raw segment is live; compaction then supersedes it.
    let from_raw = store.read_range(minute(0), minute(29), QueryOptions::default()).unwrap();
    store.compact_segment(id).unwrap().unwrap();
    let raw_file = dir.path().join(segment_file_name(SegmentTier::Raw, id, 0));
    assert!(raw_file.exists());

    let expand = |reader: eq_store::RangeReader| -> Vec<u32> {
        let mut out = Vec::new();
        for record in reader {
            match record.unwrap() {
                Record::Sample(obs) => out.push(obs.queue_length),
                Record::Run(run) => out.extend(std::iter::repeat(run.value).take(run.count as usize)),
                other => panic!("unexpected record {:?}", other),
            }
        }
        out
    };
    assert_eq!(expand(from_open), expected);
    assert_eq!(expand(from_raw), expected);
    assert!(!raw_file.exists());
    assert_eq!(values(&store, minute(0), minute(29)), expected);
}

#[test]
fn concurrent_queries_never_see_a_record_twice() {
    let dir = tempdir().unwrap();
    let (store, _) = QueueStore::open(dir.path(), &config(7, true)).unwrap();
    let total = 200;
    let barrier = Barrier::new(2);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            barrier.wait();
            for i in 0..total {
                store.append(&RawObservation::sample(minute(i), i)).unwrap();
            }
        });
        scope.spawn(|| {
            barrier.wait();
            loop {
                let seen = values(&store, minute(0), minute(total - 1));
                // Whatever has been appended so far, once and in order.
                let prefix: Vec<u32> = (0..seen.len() as u32).collect();
                assert_eq!(seen, prefix);
                if seen.len() == total as usize {
                    break;
                }
            }
        });
    });

    assert_eq!(store.footprint().observations, total as u64);
}
