//! # tally
//!
//! Embedded application telemetry: buffered samples, per-period rollups and
//! trailing-window queries over SQLite.
//!
//! tally is a Rust library for recording application events (slow requests,
//! failed jobs, cache hits) and point-in-time values (queue depths) from
//! inside the process that produces them. Samples are buffered per unit of
//! work, pre-aggregated in memory and merged into rollup buckets with atomic
//! upserts, so many processes can write the same keys concurrently.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One batch, one transaction: raw entries, rollups and values land together
//! - Duplicate keys collapse in memory before any statement is issued
//! - Rollups merge in the database (`count`, `min`, `max`, `sum`, weighted `avg`)
//! - Ten calendar periods from one hour to a tax year, each with its own retention
//! - Lazy producers, filters and recorders never fail the host's unit of work
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tally::{Aggregate, Collector, Ingest, Order, Period, SqliteStorage, Storage, TallyConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TallyConfig::default();
//! let clock = tally::clock::system();
//!
//! let storage = Arc::new(SqliteStorage::open("./telemetry.sqlite3", &config, clock.clone())?);
//! let ingest = Arc::new(Ingest::storage(storage.clone(), clock.clone()));
//!
//! // One collector per request or job.
//! let mut collector = Collector::from_config(&config, ingest, clock);
//! collector.record("slow_request", "GET /users/{id}", Some(1_250)).count().max().avg();
//! collector.set("queue_depth", "default", "42");
//! collector.ingest();
//!
//! // Slowest routes over the last 24 hours.
//! let rows = storage.aggregate(
//!     "slow_request",
//!     &[Aggregate::Count, Aggregate::Max],
//!     Period::Day,
//!     Some(Aggregate::Max),
//!     Order::default(),
//! )?;
//! for row in rows {
//!     println!("{}: {:?}", row.key, row.get(Aggregate::Max));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Collector`] — Per-unit-of-work buffer with lazy producers, filters and recorders
//! - [`Ingest`] — Gateway that stores, queues or discards a batch, and runs the trim lottery
//! - [`Storage`] — Persistence and read contract; [`SqliteStorage`] implements it
//! - [`Period`] — Calendar granularities, bucket math and retention
//!
//! ## Modules
//!
//! - [`collector`] — Buffering, buffer pressure and fault isolation
//! - [`recorder`] — Host events and the recorder contract
//! - [`ingest`] — Ingest strategies, queue and lottery
//! - [`storage`] — Storage contract, pre-aggregation and the SQLite engine
//! - [`period`] — Period calendar
//! - [`sample`] — Entries, values and aggregates
//! - [`config`] — Configuration loading and validation
//! - [`clock`] — Time source
//! - [`error`] — Error types

pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod ingest;
pub mod period;
pub mod recorder;
pub mod sample;
pub mod storage;

// Re-export primary API types at crate root for convenience.
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use collector::{Collector, RecordedEntry};
pub use config::{Driver, TallyConfig};
pub use error::{BoxError, ConfigError, QueryError, Result, StorageError, TallyError};
pub use ingest::{Ingest, Lottery, MemoryQueue};
pub use period::{Period, Window};
pub use recorder::{Event, ExceptionRecorder, Recorder};
pub use sample::{Aggregate, Entry, Sample, Value};
pub use storage::{
    Direction, Graph, KeyAggregates, KeyTypes, Order, SqliteStorage, Storage, StoreStats,
    StoredValue, TrimStats,
};
