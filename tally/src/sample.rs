//! Sample model: entries, values and aggregation intents.
//!
//! An [`Entry`] is one observed event (a request took 120ms, a job failed)
//! tagged with the [`Aggregate`]s it should feed. A [`Value`] is a
//! point-in-time snapshot (queue depth is 42) where only the latest one per
//! `(type, key)` matters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// An aggregate function supported by the rollup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    /// Number of entries.
    Count,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Sum of values.
    Sum,
    /// Mean of values, merged by sample count.
    Avg,
}

impl Aggregate {
    /// Every aggregate, in storage order.
    pub const ALL: [Aggregate; 5] = [
        Aggregate::Count,
        Aggregate::Min,
        Aggregate::Max,
        Aggregate::Sum,
        Aggregate::Avg,
    ];

    /// Name stored in the `aggregate` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregate {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| QueryError::InvalidAggregate {
                name: s.to_string(),
                allowed: Self::ALL.map(Self::as_str).join(", "),
            })
    }
}

/// Set of [`Aggregate`]s an entry feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationSet(u8);

impl AggregationSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Adds an aggregate; adding twice is a no-op.
    pub fn insert(&mut self, aggregate: Aggregate) {
        self.0 |= aggregate.bit();
    }

    /// Returns true if the aggregate is in the set.
    pub fn contains(self, aggregate: Aggregate) -> bool {
        self.0 & aggregate.bit() != 0
    }

    /// Returns true if nothing was selected.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of selected aggregates.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates selected aggregates in storage order.
    pub fn iter(self) -> impl Iterator<Item = Aggregate> {
        Aggregate::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl FromIterator<Aggregate> for AggregationSet {
    fn from_iter<I: IntoIterator<Item = Aggregate>>(iter: I) -> Self {
        let mut set = Self::empty();
        for aggregate in iter {
            set.insert(aggregate);
        }
        set
    }
}

/// One observed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Epoch seconds at which the event happened.
    pub timestamp: i64,
    /// Metric type, e.g. `slow_request`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Key within the type, e.g. a route.
    pub key: String,
    /// Measured value, if any.
    pub value: Option<i64>,
    aggregations: AggregationSet,
    only_buckets: bool,
}

impl Entry {
    /// Creates an entry with no aggregations selected.
    pub fn new(
        timestamp: i64,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: Option<i64>,
    ) -> Self {
        Self {
            timestamp,
            kind: kind.into(),
            key: key.into(),
            value,
            aggregations: AggregationSet::empty(),
            only_buckets: false,
        }
    }

    /// Feeds the `count` rollup.
    pub fn count(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Count)
    }

    /// Feeds the `min` rollup.
    pub fn min(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Min)
    }

    /// Feeds the `max` rollup.
    pub fn max(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Max)
    }

    /// Feeds the `sum` rollup.
    pub fn sum(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Sum)
    }

    /// Feeds the `avg` rollup.
    pub fn avg(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Avg)
    }

    /// Feeds the given rollup.
    pub fn aggregate(&mut self, aggregate: Aggregate) -> &mut Self {
        self.aggregations.insert(aggregate);
        self
    }

    /// Only feed rollups; do not append this entry to the raw entries table.
    ///
    /// Raw-tail reads will not see such entries.
    pub fn only_buckets(&mut self) -> &mut Self {
        self.only_buckets = true;
        self
    }

    /// The selected aggregations.
    pub fn aggregations(&self) -> AggregationSet {
        self.aggregations
    }

    /// Returns true if the entry should skip the raw entries table.
    pub fn is_only_buckets(&self) -> bool {
        self.only_buckets
    }
}

/// Latest known state for a `(type, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Epoch seconds at which the value was observed.
    pub timestamp: i64,
    /// Value type, e.g. `queue_depth`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Key within the type.
    pub key: String,
    /// The snapshot itself.
    pub value: String,
}

impl Value {
    /// Creates a value snapshot.
    pub fn new(
        timestamp: i64,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            kind: kind.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Anything the collector buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sample", rename_all = "lowercase")]
pub enum Sample {
    /// An event.
    Entry(Entry),
    /// A snapshot.
    Value(Value),
}

impl Sample {
    /// Epoch seconds of the sample.
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Entry(e) => e.timestamp,
            Self::Value(v) => v.timestamp,
        }
    }

    /// Type of the sample.
    pub fn kind(&self) -> &str {
        match self {
            Self::Entry(e) => &e.kind,
            Self::Value(v) => &v.kind,
        }
    }

    /// Key of the sample.
    pub fn key(&self) -> &str {
        match self {
            Self::Entry(e) => &e.key,
            Self::Value(v) => &v.key,
        }
    }
}

impl From<Entry> for Sample {
    fn from(entry: Entry) -> Self {
        Self::Entry(entry)
    }
}

impl From<Value> for Sample {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// 128-bit digest of a key, used as its uniqueness/index column.
///
/// Collisions are not detected; at 128 bits they are treated as impossible.
pub type KeyHash = [u8; 16];

/// Hashes a key for the `key_hash` column.
pub fn key_hash(key: &str) -> KeyHash {
    let digest = blake3::hash(key.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_are_idempotent() {
        let mut entry = Entry::new(0, "type", "key", Some(1));
        entry.count().count().max();

        let set = entry.aggregations();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Aggregate::Count));
        assert!(set.contains(Aggregate::Max));
        assert!(!set.contains(Aggregate::Avg));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Aggregate::Count, Aggregate::Max]);

        let collected: AggregationSet = [Aggregate::Max, Aggregate::Count, Aggregate::Max]
            .into_iter()
            .collect();
        assert_eq!(collected, set);
    }

    #[test]
    fn test_aggregate_names() {
        for aggregate in Aggregate::ALL {
            assert_eq!(aggregate.as_str().parse::<Aggregate>().unwrap(), aggregate);
        }

        let err = "median".parse::<Aggregate>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid aggregate type [median], allowed types: [count, min, max, sum, avg]"
        );
    }

    #[test]
    fn test_key_hash_is_stable_and_distinct() {
        assert_eq!(key_hash("/users/{id}"), key_hash("/users/{id}"));
        assert_ne!(key_hash("a"), key_hash("b"));

        let long = "x".repeat(10_000);
        assert_eq!(key_hash(&long).len(), 16);
    }

    #[test]
    fn test_sample_accessors() {
        let sample: Sample = Value::new(5, "queue", "default", "12").into();
        assert_eq!(sample.timestamp(), 5);
        assert_eq!(sample.kind(), "queue");
        assert_eq!(sample.key(), "default");
    }
}
