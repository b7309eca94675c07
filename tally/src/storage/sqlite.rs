//! SQLite implementation of [`Storage`].
//!
//! Writes run inside one `IMMEDIATE` transaction per batch. Rollup rows are
//! merged with `INSERT ... ON CONFLICT DO UPDATE` whose update expressions
//! reference the stored row and `excluded`, so SQLite evaluates each merge
//! atomically against whatever another writer committed first.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Transaction, TransactionBehavior, params, params_from_iter};
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::{TallyConfig, TrimConfig};
use crate::error::{QueryError, Result, StorageError};
use crate::period::Period;
use crate::sample::{Aggregate, Entry, Sample, Value, key_hash};
use crate::storage::preaggregate::{AggregateRow, preaggregate};
use crate::storage::{
    Graph, KeyAggregates, KeyTypes, Order, Storage, StoreStats, StoredValue, TrimStats,
};

/// Schema for the three relations. Idempotent.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tally_values (
    id          INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    type        TEXT NOT NULL,
    key         TEXT NOT NULL,
    key_hash    BLOB NOT NULL,
    value       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tally_values_timestamp ON tally_values (timestamp);
CREATE INDEX IF NOT EXISTS tally_values_type ON tally_values (type);
CREATE UNIQUE INDEX IF NOT EXISTS tally_values_type_key_hash ON tally_values (type, key_hash);

CREATE TABLE IF NOT EXISTS tally_entries (
    id          INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    type        TEXT NOT NULL,
    key         TEXT NOT NULL,
    key_hash    BLOB NOT NULL,
    value       INTEGER
);
CREATE INDEX IF NOT EXISTS tally_entries_timestamp ON tally_entries (timestamp);
CREATE INDEX IF NOT EXISTS tally_entries_type ON tally_entries (type);
CREATE INDEX IF NOT EXISTS tally_entries_key_hash ON tally_entries (key_hash);
CREATE INDEX IF NOT EXISTS tally_entries_scan ON tally_entries (timestamp, type, key_hash, value);

CREATE TABLE IF NOT EXISTS tally_aggregates (
    id          INTEGER PRIMARY KEY,
    bucket      INTEGER NOT NULL,
    period      TEXT NOT NULL,
    type        TEXT NOT NULL,
    key         TEXT NOT NULL,
    key_hash    BLOB NOT NULL,
    aggregate   TEXT NOT NULL,
    value       REAL NOT NULL,
    count       INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS tally_aggregates_unique
    ON tally_aggregates (bucket, period, type, aggregate, key_hash);
CREATE INDEX IF NOT EXISTS tally_aggregates_trim ON tally_aggregates (period, bucket);
CREATE INDEX IF NOT EXISTS tally_aggregates_type ON tally_aggregates (type);
CREATE INDEX IF NOT EXISTS tally_aggregates_read
    ON tally_aggregates (period, type, aggregate, bucket);
";

/// How long a writer waits on another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Atomic merge of an incoming rollup row into the stored one.
fn merge_clause(aggregate: Aggregate) -> &'static str {
    match aggregate {
        Aggregate::Count | Aggregate::Sum => {
            "value = tally_aggregates.value + excluded.value"
        }
        Aggregate::Min => "value = min(tally_aggregates.value, excluded.value)",
        Aggregate::Max => "value = max(tally_aggregates.value, excluded.value)",
        Aggregate::Avg => {
            "value = (tally_aggregates.value * tally_aggregates.count \
                     + excluded.value * excluded.count) \
                     / (tally_aggregates.count + excluded.count), \
             count = tally_aggregates.count + excluded.count"
        }
    }
}

/// SQLite-backed telemetry store.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    clock: SharedClock,
    /// Rows per multi-row statement.
    chunk: usize,
    /// Raw entry and value horizon.
    retention: TrimConfig,
}

impl SqliteStorage {
    /// Opens (and migrates) a database file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open<P: AsRef<Path>>(path: P, config: &TallyConfig, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref();
        let open_err = |source: rusqlite::Error| StorageError::Open {
            path: path.display().to_string(),
            source,
        };

        let conn = Connection::open(path).map_err(open_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(open_err)?;
        debug!(path = %path.display(), "opened store");
        Self::from_connection(conn, config, clock)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory(config: &TallyConfig, clock: SharedClock) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config, clock)
    }

    fn from_connection(conn: Connection, config: &TallyConfig, clock: SharedClock) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            chunk: config.storage.chunk.max(1),
            retention: config.ingest.trim.clone(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned.into())
    }

    /// Runs a read-only closure against the connection.
    ///
    /// Intended for inspection tools and tests that need raw table access.
    ///
    /// # Errors
    ///
    /// Returns whatever the closure returns, or a lock error.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    fn insert_entries(tx: &Transaction<'_>, entries: &[&Entry]) -> Result<()> {
        let mut sql = String::from(
            "INSERT INTO tally_entries (timestamp, type, key, key_hash, value) VALUES ",
        );
        sql.push_str(&vec!["(?, ?, ?, ?, ?)"; entries.len()].join(", "));

        let mut params = Vec::with_capacity(entries.len() * 5);
        for entry in entries {
            params.push(SqlValue::Integer(entry.timestamp));
            params.push(SqlValue::Text(entry.kind.clone()));
            params.push(SqlValue::Text(entry.key.clone()));
            params.push(SqlValue::Blob(key_hash(&entry.key).to_vec()));
            params.push(entry.value.map_or(SqlValue::Null, SqlValue::Integer));
        }

        tx.execute(&sql, params_from_iter(params))?;
        Ok(())
    }

    fn upsert_aggregates(
        tx: &Transaction<'_>,
        aggregate: Aggregate,
        rows: &[AggregateRow],
    ) -> Result<()> {
        let mut sql = String::from(
            "INSERT INTO tally_aggregates \
             (bucket, period, type, aggregate, key, key_hash, value, count) VALUES ",
        );
        sql.push_str(&vec!["(?, ?, ?, ?, ?, ?, ?, ?)"; rows.len()].join(", "));
        sql.push_str(
            " ON CONFLICT (bucket, period, type, aggregate, key_hash) DO UPDATE SET ",
        );
        sql.push_str(merge_clause(aggregate));

        let mut params = Vec::with_capacity(rows.len() * 8);
        for row in rows {
            params.push(SqlValue::Integer(row.bucket));
            params.push(SqlValue::Text(row.period.as_str().to_string()));
            params.push(SqlValue::Text(row.kind.clone()));
            params.push(SqlValue::Text(aggregate.as_str().to_string()));
            params.push(SqlValue::Text(row.key.clone()));
            params.push(SqlValue::Blob(key_hash(&row.key).to_vec()));
            params.push(SqlValue::Real(row.value));
            params.push(
                row.count
                    .and_then(|c| i64::try_from(c).ok())
                    .map_or(SqlValue::Null, SqlValue::Integer),
            );
        }

        tx.execute(&sql, params_from_iter(params))?;
        Ok(())
    }

    fn upsert_values(tx: &Transaction<'_>, values: &[&Value]) -> Result<()> {
        let mut sql = String::from(
            "INSERT INTO tally_values (timestamp, type, key, key_hash, value) VALUES ",
        );
        sql.push_str(&vec!["(?, ?, ?, ?, ?)"; values.len()].join(", "));
        sql.push_str(
            " ON CONFLICT (type, key_hash) DO UPDATE SET \
             timestamp = excluded.timestamp, value = excluded.value",
        );

        let mut params = Vec::with_capacity(values.len() * 5);
        for value in values {
            params.push(SqlValue::Integer(value.timestamp));
            params.push(SqlValue::Text(value.kind.clone()));
            params.push(SqlValue::Text(value.key.clone()));
            params.push(SqlValue::Blob(key_hash(&value.key).to_vec()));
            params.push(SqlValue::Text(value.value.clone()));
        }

        tx.execute(&sql, params_from_iter(params))?;
        Ok(())
    }
}

/// Keeps only the last value per `(type, key)`; later samples supersede
/// earlier ones.
fn collapse_values<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut seen = HashSet::new();
    let mut collapsed = Vec::with_capacity(values.len());
    for &value in values.iter().rev() {
        if seen.insert((value.kind.as_str(), value.key.as_str())) {
            collapsed.push(value);
        }
    }
    collapsed.reverse();
    collapsed
}

/// A SQL string with numbered parameters, built up piecewise.
#[derive(Debug, Default)]
struct Query {
    sql: String,
    params: Vec<SqlValue>,
}

impl Query {
    /// Binds a parameter and returns its placeholder.
    fn bind(&mut self, value: impl Into<SqlValue>) -> String {
        self.params.push(value.into());
        format!("?{}", self.params.len())
    }

    fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    fn bind_list(&mut self, items: &[&str]) -> String {
        items
            .iter()
            .map(|item| self.bind(item.to_string()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Raw-tail and bucket expressions for one aggregate column.
///
/// `avg` needs two columns (weighted sum and sample count) so both tiers can
/// be merged by weight rather than by averaging averages.
struct Column;

impl Column {
    fn tail(aggregate: Aggregate, filter: &str, alias: &str) -> String {
        let value = format!("CASE WHEN {filter} THEN value END");
        match aggregate {
            Aggregate::Count => format!("count(CASE WHEN {filter} THEN 1 END) AS {alias}"),
            Aggregate::Min => format!("min({value}) AS {alias}"),
            Aggregate::Max => format!("max({value}) AS {alias}"),
            Aggregate::Sum => format!("sum({value}) AS {alias}"),
            Aggregate::Avg => format!("sum({value}) AS {alias}_sum, count({value}) AS {alias}_n"),
        }
    }

    fn bucket(aggregate: Aggregate, filter: &str, alias: &str) -> String {
        let value = format!("CASE WHEN {filter} THEN value END");
        match aggregate {
            Aggregate::Count | Aggregate::Sum => format!("sum({value}) AS {alias}"),
            Aggregate::Min => format!("min({value}) AS {alias}"),
            Aggregate::Max => format!("max({value}) AS {alias}"),
            Aggregate::Avg => format!(
                "sum(CASE WHEN {filter} THEN value * count END) AS {alias}_sum, \
                 sum(CASE WHEN {filter} THEN count END) AS {alias}_n"
            ),
        }
    }

    fn null(aggregate: Aggregate, alias: &str) -> String {
        match aggregate {
            Aggregate::Avg => format!("NULL AS {alias}_sum, NULL AS {alias}_n"),
            _ => format!("NULL AS {alias}"),
        }
    }

    fn merge(aggregate: Aggregate, alias: &str) -> String {
        match aggregate {
            Aggregate::Count | Aggregate::Sum => format!("coalesce(sum({alias}), 0) AS {alias}"),
            Aggregate::Min => format!("min({alias}) AS {alias}"),
            Aggregate::Max => format!("max({alias}) AS {alias}"),
            Aggregate::Avg => {
                format!("CAST(sum({alias}_sum) AS REAL) / sum({alias}_n) AS {alias}")
            }
        }
    }
}

/// Column alias for an aggregate in a per-key listing.
fn alias(aggregate: Aggregate) -> String {
    format!("agg_{}", aggregate.as_str())
}

fn dedup<T: PartialEq + Copy>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(*item);
        }
    }
    out
}

impl Storage for SqliteStorage {
    fn store(&self, samples: &[Sample]) -> Result<StoreStats> {
        if samples.is_empty() {
            return Ok(StoreStats::default());
        }

        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entries = Vec::new();
        let mut values = Vec::new();
        for sample in samples {
            match sample {
                Sample::Entry(e) => entries.push(e),
                Sample::Value(v) => values.push(v),
            }
        }

        let mut stats = StoreStats::default();

        let raw: Vec<&Entry> = entries
            .iter()
            .copied()
            .filter(|e| !e.is_only_buckets())
            .collect();
        for chunk in raw.chunks(self.chunk) {
            Self::insert_entries(&tx, chunk)?;
            stats.entries += chunk.len();
            stats.entry_statements += 1;
        }

        for (aggregate, rows) in preaggregate(entries.iter().copied(), now) {
            for chunk in rows.chunks(self.chunk) {
                Self::upsert_aggregates(&tx, aggregate, chunk)?;
                stats.aggregates += chunk.len();
                stats.aggregate_statements += 1;
            }
        }

        let values = collapse_values(&values);
        for chunk in values.chunks(self.chunk) {
            Self::upsert_values(&tx, chunk)?;
            stats.values += chunk.len();
            stats.value_statements += 1;
        }

        tx.commit()?;

        debug!(
            entries = stats.entries,
            aggregates = stats.aggregates,
            values = stats.values,
            "stored batch"
        );
        Ok(stats)
    }

    fn trim(&self) -> Result<TrimStats> {
        let now = self.clock.now();
        let horizon = self.retention.horizon(now);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut stats = TrimStats {
            values: tx.execute(
                "DELETE FROM tally_values WHERE timestamp <= ?1",
                params![horizon],
            )?,
            entries: tx.execute(
                "DELETE FROM tally_entries WHERE timestamp <= ?1",
                params![horizon],
            )?,
            aggregates: 0,
        };

        for period in Period::ALL {
            stats.aggregates += tx.execute(
                "DELETE FROM tally_aggregates WHERE period = ?1 AND bucket <= ?2",
                params![period.as_str(), period.oldest_retained_bucket(now)],
            )?;
        }

        tx.commit()?;

        debug!(
            values = stats.values,
            entries = stats.entries,
            aggregates = stats.aggregates,
            "trimmed storage"
        );
        Ok(stats)
    }

    fn purge(&self, types: Option<&[&str]>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for table in ["tally_values", "tally_entries", "tally_aggregates"] {
            match types {
                None => {
                    tx.execute(&format!("DELETE FROM {table}"), [])?;
                }
                Some([]) => {}
                Some(types) => {
                    let mut q = Query::default();
                    let list = q.bind_list(types);
                    q.push(&format!("DELETE FROM {table} WHERE type IN ({list})"));
                    tx.execute(&q.sql, params_from_iter(q.params))?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn values(&self, kind: &str, keys: Option<&[&str]>) -> Result<BTreeMap<String, StoredValue>> {
        if keys.is_some_and(<[&str]>::is_empty) {
            return Ok(BTreeMap::new());
        }

        let mut q = Query::default();
        let kind = q.bind(kind.to_string());
        q.push(&format!(
            "SELECT timestamp, key, value FROM tally_values WHERE type = {kind}"
        ));
        if let Some(keys) = keys {
            let hashes: Vec<String> = keys
                .iter()
                .map(|k| q.bind(key_hash(k).to_vec()))
                .collect();
            q.push(&format!(" AND key_hash IN ({})", hashes.join(", ")));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&q.sql)?;
        let rows = stmt.query_map(params_from_iter(q.params.iter()), |row| {
            Ok(StoredValue {
                timestamp: row.get(0)?,
                key: row.get(1)?,
                value: row.get(2)?,
            })
        })?;

        let mut out = BTreeMap::new();
        for row in rows {
            let value = row?;
            out.insert(value.key.clone(), value);
        }
        Ok(out)
    }

    fn graph(&self, types: &[&str], aggregate: Aggregate, period: Period) -> Result<Graph> {
        if types.is_empty() {
            return Ok(Graph::new());
        }

        let now = self.clock.now();
        let buckets = period.recent_buckets(now, period.max_buckets_retained());
        let first = buckets.first().copied().unwrap_or_else(|| period.current_bucket(now));
        let padding: BTreeMap<String, f64> =
            buckets.iter().map(|&b| (period.format(b), 0.0)).collect();

        let mut q = Query::default();
        let list = q.bind_list(types);
        let aggregate_param = q.bind(aggregate.as_str().to_string());
        let period_param = q.bind(period.as_str().to_string());
        let first_param = q.bind(first);
        q.push(&format!(
            "SELECT bucket, type, key, value FROM tally_aggregates \
             WHERE type IN ({list}) AND aggregate = {aggregate_param} \
             AND period = {period_param} AND bucket >= {first_param} \
             ORDER BY bucket"
        ));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&q.sql)?;
        let rows = stmt.query_map(params_from_iter(q.params.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut graph = Graph::new();
        for row in rows {
            let (bucket, kind, key, value) = row?;
            let label = period.format(bucket);
            if !padding.contains_key(&label) {
                continue;
            }
            let by_type = graph.entry(key).or_insert_with(|| {
                types
                    .iter()
                    .map(|t| ((*t).to_string(), padding.clone()))
                    .collect()
            });
            if let Some(series) = by_type.get_mut(&kind) {
                series.insert(label, value);
            }
        }
        Ok(graph)
    }

    fn aggregate(
        &self,
        kind: &str,
        aggregates: &[Aggregate],
        period: Period,
        order_by: Option<Aggregate>,
        order: Order,
    ) -> Result<Vec<KeyAggregates>> {
        let aggregates = dedup(aggregates);
        let Some(&first) = aggregates.first() else {
            return Err(QueryError::Empty { what: "aggregate" }.into());
        };
        let order_by = order_by.unwrap_or(first);
        if !aggregates.contains(&order_by) {
            return Err(QueryError::InvalidOrder {
                column: order_by.to_string(),
            }
            .into());
        }

        let now = self.clock.now();
        let window = period.recent_window(now);
        let first_closed = period.first_closed_bucket(now);

        let mut q = Query::default();
        let kind = q.bind(kind.to_string());
        let start = q.bind(window.start);
        let closed = q.bind(first_closed);
        let period_param = q.bind(period.as_str().to_string());

        // Tail: raw entries older than the first whole bucket.
        let tail_cols: Vec<String> = aggregates
            .iter()
            .map(|&a| Column::tail(a, "1", &alias(a)))
            .collect();
        q.push(&format!(
            "SELECT key_hash, key, {} FROM tally_entries \
             WHERE type = {kind} AND timestamp >= {start} AND timestamp < {closed} \
             GROUP BY key_hash",
            tail_cols.join(", ")
        ));

        // Buckets: one branch per aggregate, other columns null.
        for &current in &aggregates {
            let cols: Vec<String> = aggregates
                .iter()
                .map(|&a| {
                    if a == current {
                        Column::bucket(a, "1", &alias(a))
                    } else {
                        Column::null(a, &alias(a))
                    }
                })
                .collect();
            q.push(&format!(
                " UNION ALL SELECT key_hash, key, {} FROM tally_aggregates \
                 WHERE period = {period_param} AND type = {kind} \
                 AND aggregate = '{}' AND bucket >= {closed} \
                 GROUP BY key_hash",
                cols.join(", "),
                current.as_str()
            ));
        }

        let merged: Vec<String> = aggregates
            .iter()
            .map(|&a| Column::merge(a, &alias(a)))
            .collect();
        let inner = std::mem::take(&mut q.sql);
        let limit = q.bind(i64::try_from(order.limit).unwrap_or(i64::MAX));
        q.push(&format!(
            "SELECT min(key), {} FROM ({inner}) AS results \
             GROUP BY key_hash ORDER BY {} {} LIMIT {limit}",
            merged.join(", "),
            alias(order_by),
            order.direction.sql()
        ));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&q.sql)?;
        let rows = stmt.query_map(params_from_iter(q.params.iter()), |row| {
            let key: String = row.get(0)?;
            let mut values = BTreeMap::new();
            for (i, &a) in aggregates.iter().enumerate() {
                values.insert(a, row.get::<_, Option<f64>>(i + 1)?);
            }
            Ok(KeyAggregates { key, values })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn aggregate_types(
        &self,
        types: &[&str],
        aggregate: Aggregate,
        period: Period,
        order_by: Option<&str>,
        order: Order,
    ) -> Result<Vec<KeyTypes>> {
        let types = dedup(types);
        let Some(&first) = types.first() else {
            return Err(QueryError::Empty { what: "type" }.into());
        };
        let order_by = order_by.unwrap_or(first);
        let Some(order_index) = types.iter().position(|t| *t == order_by) else {
            return Err(QueryError::InvalidOrder {
                column: order_by.to_string(),
            }
            .into());
        };

        let now = self.clock.now();
        let window = period.recent_window(now);
        let first_closed = period.first_closed_bucket(now);

        let mut q = Query::default();
        let type_params: Vec<String> = types.iter().map(|t| q.bind((*t).to_string())).collect();
        let list = type_params.join(", ");
        let start = q.bind(window.start);
        let closed = q.bind(first_closed);
        let period_param = q.bind(period.as_str().to_string());
        let aggregate_param = q.bind(aggregate.as_str().to_string());

        let aliases: Vec<String> = (0..types.len()).map(|i| format!("t{i}")).collect();

        let tail_cols: Vec<String> = type_params
            .iter()
            .zip(&aliases)
            .map(|(p, alias)| Column::tail(aggregate, &format!("type = {p}"), alias))
            .collect();
        let bucket_cols: Vec<String> = type_params
            .iter()
            .zip(&aliases)
            .map(|(p, alias)| Column::bucket(aggregate, &format!("type = {p}"), alias))
            .collect();
        let merged: Vec<String> = aliases.iter().map(|a| Column::merge(aggregate, a)).collect();

        q.push(&format!(
            "SELECT key_hash, key, {tail} FROM tally_entries \
             WHERE type IN ({list}) AND timestamp >= {start} AND timestamp < {closed} \
             GROUP BY key_hash \
             UNION ALL \
             SELECT key_hash, key, {buckets} FROM tally_aggregates \
             WHERE period = {period_param} AND type IN ({list}) \
             AND aggregate = {aggregate_param} AND bucket >= {closed} \
             GROUP BY key_hash",
            tail = tail_cols.join(", "),
            buckets = bucket_cols.join(", "),
        ));

        let inner = std::mem::take(&mut q.sql);
        let limit = q.bind(i64::try_from(order.limit).unwrap_or(i64::MAX));
        q.push(&format!(
            "SELECT min(key), {} FROM ({inner}) AS results \
             GROUP BY key_hash ORDER BY {} {} LIMIT {limit}",
            merged.join(", "),
            aliases[order_index],
            order.direction.sql()
        ));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&q.sql)?;
        let rows = stmt.query_map(params_from_iter(q.params.iter()), |row| {
            let key: String = row.get(0)?;
            let mut values = BTreeMap::new();
            for (i, kind) in types.iter().enumerate() {
                values.insert((*kind).to_string(), row.get::<_, Option<f64>>(i + 1)?);
            }
            Ok(KeyTypes { key, values })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn aggregate_total(
        &self,
        types: &[&str],
        aggregate: Aggregate,
        period: Period,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        let empty = match aggregate {
            Aggregate::Count | Aggregate::Sum => Some(0.0),
            Aggregate::Min | Aggregate::Max | Aggregate::Avg => None,
        };
        let mut totals: BTreeMap<String, Option<f64>> =
            types.iter().map(|t| ((*t).to_string(), empty)).collect();
        if types.is_empty() {
            return Ok(totals);
        }

        let now = self.clock.now();
        let window = period.recent_window(now);
        let first_closed = period.first_closed_bucket(now);

        let mut q = Query::default();
        let list = q.bind_list(types);
        let start = q.bind(window.start);
        let closed = q.bind(first_closed);
        let period_param = q.bind(period.as_str().to_string());
        let aggregate_param = q.bind(aggregate.as_str().to_string());

        q.push(&format!(
            "SELECT type, {merged} FROM ( \
             SELECT type, {tail} FROM tally_entries \
             WHERE type IN ({list}) AND timestamp >= {start} AND timestamp < {closed} \
             GROUP BY type \
             UNION ALL \
             SELECT type, {buckets} FROM tally_aggregates \
             WHERE period = {period_param} AND type IN ({list}) \
             AND aggregate = {aggregate_param} AND bucket >= {closed} \
             GROUP BY type \
             ) AS results GROUP BY type",
            merged = Column::merge(aggregate, "v"),
            tail = Column::tail(aggregate, "1", "v"),
            buckets = Column::bucket(aggregate, "1", "v"),
        ));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&q.sql)?;
        let rows = stmt.query_map(params_from_iter(q.params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
        })?;

        for row in rows {
            let (kind, value) = row?;
            if value.is_some() {
                totals.insert(kind, value);
            }
        }
        Ok(totals)
    }
}
