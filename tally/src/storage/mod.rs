//! Storage engine: raw entries, latest values and per-period rollups.
//!
//! # Design
//!
//! Three relations back the engine:
//!
//! ```text
//! tally_values      (timestamp, type, key, key_hash, value)        latest snapshot per (type, key)
//! tally_entries     (timestamp, type, key, key_hash, value)        append-only raw events
//! tally_aggregates  (bucket, period, type, key, key_hash,
//!                    aggregate, value, count)                      one rollup row per bucket
//! ```
//!
//! [`Storage::store`] folds a batch into in-memory accumulators first (see
//! [`preaggregate`]) so that every `(bucket, period, type, aggregate, key)`
//! produces a single row, then upserts those rows with merge expressions the
//! database evaluates itself. Concurrent writers therefore combine into the
//! same bucket without read-modify-write races.
//!
//! Reads over a period combine two tiers: the raw tail of the window that is
//! older than the first whole bucket, and the rollup buckets themselves.

pub mod preaggregate;
pub mod sqlite;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::period::Period;
use crate::sample::{Aggregate, Sample};

pub use preaggregate::AggregateRow;
pub use sqlite::SqliteStorage;

/// Persistence contract used by the ingest gateway and the read side.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Stores a batch atomically: raw entries, rollups and collapsed values.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing from the batch is
    /// persisted in that case.
    fn store(&self, samples: &[Sample]) -> Result<StoreStats>;

    /// Deletes rows past their retention horizon.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    fn trim(&self) -> Result<TrimStats>;

    /// Deletes every row, or every row of the given types.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    fn purge(&self, types: Option<&[&str]>) -> Result<()>;

    /// Latest values for a type, keyed by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn values(&self, kind: &str, keys: Option<&[&str]>) -> Result<BTreeMap<String, StoredValue>>;

    /// Zero-filled bucket series per key and type.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn graph(&self, types: &[&str], aggregate: Aggregate, period: Period) -> Result<Graph>;

    /// Per-key aggregates of one type over the period's trailing window.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`](crate::error::QueryError) if `aggregates` is
    /// empty or `order_by` is not one of them, or an error if the query fails.
    fn aggregate(
        &self,
        kind: &str,
        aggregates: &[Aggregate],
        period: Period,
        order_by: Option<Aggregate>,
        order: Order,
    ) -> Result<Vec<KeyAggregates>>;

    /// Per-key aggregate of several types side by side.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`](crate::error::QueryError) if `types` is empty
    /// or `order_by` is not one of them, or an error if the query fails.
    fn aggregate_types(
        &self,
        types: &[&str],
        aggregate: Aggregate,
        period: Period,
        order_by: Option<&str>,
        order: Order,
    ) -> Result<Vec<KeyTypes>>;

    /// One aggregate per type across all keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn aggregate_total(
        &self,
        types: &[&str],
        aggregate: Aggregate,
        period: Period,
    ) -> Result<BTreeMap<String, Option<f64>>>;
}

/// What a [`Storage::store`] call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Raw entries appended.
    pub entries: usize,
    /// Rollup rows upserted.
    pub aggregates: usize,
    /// Values upserted after collapsing.
    pub values: usize,
    /// Insert statements against the entries table.
    pub entry_statements: usize,
    /// Upsert statements against the aggregates table.
    pub aggregate_statements: usize,
    /// Upsert statements against the values table.
    pub value_statements: usize,
}

/// What a [`Storage::trim`] call deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrimStats {
    /// Values deleted.
    pub values: usize,
    /// Raw entries deleted.
    pub entries: usize,
    /// Rollup rows deleted.
    pub aggregates: usize,
}

/// A stored value snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    /// When the value was observed.
    pub timestamp: i64,
    /// The key.
    pub key: String,
    /// The snapshot.
    pub value: String,
}

/// Sort direction for aggregate listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    Asc,
    /// Largest first.
    #[default]
    Desc,
}

impl Direction {
    fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Ordering and limit for aggregate listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Sort direction.
    pub direction: Direction,
    /// Maximum number of keys returned.
    pub limit: usize,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            direction: Direction::Desc,
            limit: 101,
        }
    }
}

/// Aggregates of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyAggregates {
    /// The key.
    pub key: String,
    /// Requested aggregates; `None` when no sample contributed.
    pub values: BTreeMap<Aggregate, Option<f64>>,
}

impl KeyAggregates {
    /// Returns one aggregate, if requested and present.
    pub fn get(&self, aggregate: Aggregate) -> Option<f64> {
        self.values.get(&aggregate).copied().flatten()
    }
}

/// One aggregate of one key across several types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyTypes {
    /// The key.
    pub key: String,
    /// Aggregate per requested type; `None` when no sample contributed.
    pub values: BTreeMap<String, Option<f64>>,
}

impl KeyTypes {
    /// Returns the aggregate for one type.
    pub fn get(&self, kind: &str) -> Option<f64> {
        self.values.get(kind).copied().flatten()
    }
}

/// Bucket label to value, every expected bucket present.
pub type Series = BTreeMap<String, f64>;

/// Graph data: key, then type, then zero-filled series.
pub type Graph = BTreeMap<String, BTreeMap<String, Series>>;
