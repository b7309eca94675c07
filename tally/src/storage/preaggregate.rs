//! In-memory pre-aggregation of a batch before it reaches the store.
//!
//! Every entry is folded into one accumulator per
//! `(type, period, bucket, key)` and aggregate kind, so a batch produces at
//! most one row per rollup key no matter how many entries share it. The
//! accumulators use the same merge rules the database applies on conflict,
//! which keeps the two stages composable:
//!
//! - `count`: `value + 1`
//! - `min` / `max`: running extreme, first entry initialises
//! - `sum`: `value + entry`
//! - `avg`: running mean plus sample count,
//!   `mean' = (mean * n + entry) / (n + 1)`, `n' = n + 1`
//!
//! Entries whose bucket is at or before a period's retention cutoff are
//! skipped for that period; the rows would be trimmed immediately.

use std::collections::{BTreeMap, HashMap};

use crate::period::Period;
use crate::sample::{Aggregate, Entry};

/// One rollup row ready to be merged into the aggregates table.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    /// Bucket start, epoch seconds.
    pub bucket: i64,
    /// Rollup granularity.
    pub period: Period,
    /// Entry type.
    pub kind: String,
    /// Aggregate function.
    pub aggregate: Aggregate,
    /// Entry key.
    pub key: String,
    /// Aggregated value (the mean for `avg`).
    pub value: f64,
    /// Sample count behind `value`; only set for `avg`.
    pub count: Option<u64>,
}

impl AggregateRow {
    /// Folds one more entry value into the row.
    #[allow(clippy::cast_precision_loss)] // counts stay far below 2^52
    fn fold(&mut self, value: Option<i64>) {
        // Sample values are i64, f64 is the column type.
        let value = value.map(|v| v as f64);

        match (self.aggregate, value) {
            (Aggregate::Count, _) => self.value += 1.0,
            (_, None) => {}
            (Aggregate::Min, Some(value)) => self.value = self.value.min(value),
            (Aggregate::Max, Some(value)) => self.value = self.value.max(value),
            (Aggregate::Sum, Some(value)) => self.value += value,
            (Aggregate::Avg, Some(value)) => {
                let n = self.count.unwrap_or(0);
                self.value = (self.value * n as f64 + value) / (n + 1) as f64;
                self.count = Some(n + 1);
            }
        }
    }
}

/// Accumulates rows for a single aggregate kind, in first-seen order.
#[derive(Debug)]
struct Accumulator {
    aggregate: Aggregate,
    index: HashMap<(String, Period, i64, String), usize>,
    rows: Vec<AggregateRow>,
}

impl Accumulator {
    fn new(aggregate: Aggregate) -> Self {
        Self {
            aggregate,
            index: HashMap::new(),
            rows: Vec::new(),
        }
    }

    fn add(&mut self, entry: &Entry, period: Period, bucket: i64) {
        let slot = (entry.kind.clone(), period, bucket, entry.key.clone());
        if let Some(&i) = self.index.get(&slot) {
            self.rows[i].fold(entry.value);
            return;
        }

        // Value-based rollups need a value to start from.
        if self.aggregate != Aggregate::Count && entry.value.is_none() {
            return;
        }

        let mut row = AggregateRow {
            bucket,
            period,
            kind: entry.kind.clone(),
            aggregate: self.aggregate,
            key: entry.key.clone(),
            value: 0.0,
            count: None,
        };
        match self.aggregate {
            Aggregate::Count => row.fold(entry.value),
            Aggregate::Avg => {
                row.count = Some(0);
                row.fold(entry.value);
            }
            #[allow(clippy::cast_precision_loss)] // see AggregateRow::fold
            Aggregate::Min | Aggregate::Max | Aggregate::Sum => {
                row.value = entry.value.unwrap_or_default() as f64;
            }
        }

        self.index.insert(slot, self.rows.len());
        self.rows.push(row);
    }
}

/// Folds entries into rollup rows for every period, grouped by aggregate.
///
/// `now` decides each period's retention cutoff. Aggregates with no rows are
/// absent from the result.
pub fn preaggregate<'a, I>(entries: I, now: i64) -> BTreeMap<Aggregate, Vec<AggregateRow>>
where
    I: IntoIterator<Item = &'a Entry>,
{
    let cutoffs: Vec<(Period, i64)> = Period::ALL
        .iter()
        .map(|&p| (p, p.oldest_retained_bucket(now)))
        .collect();

    let mut accumulators: BTreeMap<Aggregate, Accumulator> = BTreeMap::new();

    for entry in entries {
        let aggregations = entry.aggregations();
        if aggregations.is_empty() {
            continue;
        }

        for &(period, cutoff) in &cutoffs {
            let bucket = period.bucket_of(entry.timestamp);
            if bucket <= cutoff {
                continue;
            }

            for aggregate in aggregations.iter() {
                accumulators
                    .entry(aggregate)
                    .or_insert_with(|| Accumulator::new(aggregate))
                    .add(entry, period, bucket);
            }
        }
    }

    accumulators
        .into_iter()
        .filter(|(_, acc)| !acc.rows.is_empty())
        .map(|(aggregate, acc)| (aggregate, acc.rows))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_710_431_249; // 2024-03-14 15:47:29 UTC

    fn entry(key: &str, value: Option<i64>) -> Entry {
        Entry::new(NOW, "type", key, value)
    }

    fn row<'a>(rows: &'a [AggregateRow], period: Period, key: &str) -> &'a AggregateRow {
        rows.iter()
            .find(|r| r.period == period && r.key == key)
            .unwrap()
    }

    #[test]
    fn test_all_aggregates_fold() {
        let mut a = entry("key1", Some(200));
        a.count().min().max().sum().avg();
        let mut b = entry("key1", Some(100));
        b.count().min().max().sum().avg();

        let rows = preaggregate([&a, &b], NOW);
        assert_eq!(rows.len(), 5);

        for period in Period::ALL {
            assert_eq!(row(&rows[&Aggregate::Count], period, "key1").value, 2.0);
            assert_eq!(row(&rows[&Aggregate::Min], period, "key1").value, 100.0);
            assert_eq!(row(&rows[&Aggregate::Max], period, "key1").value, 200.0);
            assert_eq!(row(&rows[&Aggregate::Sum], period, "key1").value, 300.0);

            let avg = row(&rows[&Aggregate::Avg], period, "key1");
            assert_eq!(avg.value, 150.0);
            assert_eq!(avg.count, Some(2));
        }
    }

    #[test]
    fn test_duplicates_collapse_to_one_row_per_key() {
        let mut entries = Vec::new();
        for _ in 0..3 {
            let mut e = entry("key1", None);
            e.count();
            entries.push(e);
        }
        let mut e = entry("key2", None);
        e.count();
        entries.push(e);

        let rows = preaggregate(&entries, NOW);
        let counts = &rows[&Aggregate::Count];
        assert_eq!(counts.len(), 2 * Period::ALL.len());
        assert_eq!(row(counts, Period::Day, "key1").value, 3.0);
        assert_eq!(row(counts, Period::Day, "key2").value, 1.0);
        assert!(counts.iter().all(|r| r.count.is_none()));
    }

    #[test]
    fn test_online_average() {
        let entries: Vec<_> = [100, 300, 200]
            .into_iter()
            .map(|v| {
                let mut e = entry("key", Some(v));
                e.avg();
                e
            })
            .collect();

        let rows = preaggregate(&entries, NOW);
        let avg = row(&rows[&Aggregate::Avg], Period::Hour, "key");
        assert_eq!(avg.value, 200.0);
        assert_eq!(avg.count, Some(3));
    }

    #[test]
    fn test_expired_entries_skipped_per_period() {
        // Two hours old: outside Hour retention, inside Day retention.
        let mut old = Entry::new(NOW - 2 * 3600, "type", "key", Some(1));
        old.count();

        let rows = preaggregate([&old], NOW);
        let counts = &rows[&Aggregate::Count];
        assert!(counts.iter().all(|r| r.period != Period::Hour));
        assert!(counts.iter().any(|r| r.period == Period::Day));
        assert_eq!(counts.len(), Period::ALL.len() - 1);
    }

    #[test]
    fn test_entry_in_cutoff_bucket_skipped() {
        let cutoff = Period::Hour.oldest_retained_bucket(NOW);
        let mut e = Entry::new(cutoff + 59, "type", "key", None);
        e.count();

        let rows = preaggregate([&e], NOW);
        assert!(rows[&Aggregate::Count].iter().all(|r| r.period != Period::Hour));
    }

    #[test]
    fn test_missing_values_only_feed_count() {
        let mut e = entry("key", None);
        e.count().min().sum().avg();

        let rows = preaggregate([&e], NOW);
        assert_eq!(rows.keys().copied().collect::<Vec<_>>(), vec![Aggregate::Count]);
    }

    #[test]
    fn test_untagged_entries_produce_nothing() {
        let e = entry("key", Some(5));
        assert!(preaggregate([&e], NOW).is_empty());
    }
}
