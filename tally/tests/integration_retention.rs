//! Integration tests for retention and trimming.
//!
//! These tests step a fixed clock across retention boundaries and verify
//! that trimming deletes a bucket exactly when it reaches its period's
//! cutoff, that calendar periods subtract real months, that raw rows follow
//! the separate raw horizon, and that expired samples never create rollups.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use tally::{
    Aggregate, Entry, FixedClock, Period, Sample, SqliteStorage, Storage, TallyConfig, Value,
};

/// 2024-03-14 15:00:00 UTC, aligned to the hour.
const HOUR_START: i64 = 1_710_428_400;
/// 2024-03-01 00:00:00 UTC.
const MARCH_1: i64 = 1_709_251_200;
/// 2024-09-01 00:00:00 UTC.
const SEPTEMBER_1: i64 = 1_725_148_800;
/// 2025-03-14 15:00:00 UTC, one calendar year after `HOUR_START`.
const NEXT_YEAR: i64 = 1_741_964_400;
/// 2024-03-14 15:47:29 UTC.
const NOW: i64 = 1_710_431_249;

fn setup(now: i64) -> (SqliteStorage, FixedClock) {
    let clock = FixedClock::new(now);
    let storage =
        SqliteStorage::open_in_memory(&TallyConfig::default(), Arc::new(clock.clone())).unwrap();
    (storage, clock)
}

fn counted(timestamp: i64) -> Sample {
    let mut entry = Entry::new(timestamp, "type", "key", Some(1));
    entry.count();
    entry.into()
}

fn has_bucket(storage: &SqliteStorage, period: Period, bucket: i64) -> bool {
    storage
        .with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM tally_aggregates \
                     WHERE period = ?1 AND bucket = ?2 AND aggregate = ?3",
                    rusqlite::params![period.as_str(), bucket, Aggregate::Count.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
        .unwrap()
}

fn rows_in(storage: &SqliteStorage, table: &str) -> i64 {
    storage
        .with_connection(|conn| {
            Ok(conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?)
        })
        .unwrap()
}

#[test]
fn test_hour_bucket_deleted_exactly_at_window_end() {
    let (storage, clock) = setup(HOUR_START + 30);
    storage.store(&[counted(HOUR_START + 30)]).unwrap();
    assert!(has_bucket(&storage, Period::Hour, HOUR_START));

    // 60 one-minute buckets are retained.
    clock.set(HOUR_START + 3600 - 1);
    storage.trim().unwrap();
    assert!(has_bucket(&storage, Period::Hour, HOUR_START));

    clock.set(HOUR_START + 3600);
    let stats = storage.trim().unwrap();
    assert!(!has_bucket(&storage, Period::Hour, HOUR_START));
    assert_eq!(stats.aggregates, 1);

    // Coarser periods keep their own rows.
    assert!(has_bucket(&storage, Period::Day, HOUR_START));
}

#[test]
fn test_day_bucket_deleted_exactly_at_window_end() {
    let (storage, clock) = setup(HOUR_START);
    storage.store(&[counted(HOUR_START)]).unwrap();

    // 24 one-hour buckets are retained.
    clock.set(HOUR_START + 86_400 - 1);
    storage.trim().unwrap();
    assert!(has_bucket(&storage, Period::Day, HOUR_START));

    clock.set(HOUR_START + 86_400);
    storage.trim().unwrap();
    assert!(!has_bucket(&storage, Period::Day, HOUR_START));
}

#[test]
fn test_month_buckets_use_calendar_subtraction() {
    let (storage, clock) = setup(MARCH_1 + 3600);
    storage.store(&[counted(MARCH_1 + 3600)]).unwrap();
    assert!(has_bucket(&storage, Period::HalfYear, MARCH_1));

    // Six calendar months later, not six times thirty days.
    clock.set(SEPTEMBER_1 - 1);
    storage.trim().unwrap();
    assert!(has_bucket(&storage, Period::HalfYear, MARCH_1));

    clock.set(SEPTEMBER_1);
    storage.trim().unwrap();
    assert!(!has_bucket(&storage, Period::HalfYear, MARCH_1));
    assert!(has_bucket(&storage, Period::Year, MARCH_1));
}

#[test]
fn test_raw_rows_follow_fixed_horizon() {
    let (storage, clock) = setup(HOUR_START);
    storage
        .store(&[
            counted(HOUR_START),
            Value::new(HOUR_START, "queue", "default", "3").into(),
        ])
        .unwrap();

    clock.set(NEXT_YEAR - 1);
    let stats = storage.trim().unwrap();
    assert_eq!((stats.entries, stats.values), (0, 0));
    assert_eq!(rows_in(&storage, "tally_entries"), 1);
    assert_eq!(rows_in(&storage, "tally_values"), 1);

    clock.set(NEXT_YEAR);
    let stats = storage.trim().unwrap();
    assert_eq!((stats.entries, stats.values), (1, 1));
    assert_eq!(rows_in(&storage, "tally_entries"), 0);
    assert_eq!(rows_in(&storage, "tally_values"), 0);
}

#[test]
fn test_expired_samples_create_no_rollups() {
    let now = HOUR_START + 7200;
    let (storage, _) = setup(now);

    // At the Hour cutoff: kept raw, never aggregated for Hour.
    let cutoff = Period::Hour.oldest_retained_bucket(now);
    storage.store(&[counted(cutoff)]).unwrap();

    assert_eq!(rows_in(&storage, "tally_entries"), 1);
    assert!(!has_bucket(&storage, Period::Hour, cutoff));
    assert!(has_bucket(&storage, Period::Day, Period::Day.bucket_of(cutoff)));

    // Trimming right away finds nothing to delete.
    let stats = storage.trim().unwrap();
    assert_eq!(stats.aggregates, 0);
}

#[test]
fn test_year_tail_survives_trim_across_leap_day() {
    // The trailing year from NOW spans 2024-02-29, so it is 366 days long.
    let (storage, _) = setup(NOW);
    let early = Period::Year.recent_window(NOW).start + 3600;
    assert!(early < NOW - 365 * 86_400);

    let mut entry = Entry::new(early, "req", "key", None);
    entry.count();
    storage.store(&[entry.into()]).unwrap();

    let total = || {
        storage
            .aggregate_total(&["req"], Aggregate::Count, Period::Year)
            .unwrap()["req"]
    };
    assert_eq!(total(), Some(1.0));

    let stats = storage.trim().unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(rows_in(&storage, "tally_entries"), 1);
    assert_eq!(total(), Some(1.0));
}
