//! Error types for the tally telemetry pipeline.

use thiserror::Error;

/// Boxed error raised by user-supplied callbacks (lazy producers, filters,
/// recorders).
///
/// These never abort an ingest pass; they are routed to the collector's
/// fault handler instead.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for all tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Error reading or writing the backing store.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Error validating a read query.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<rusqlite::Error> for TallyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(e))
    }
}

/// Errors raised by the storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database file could not be opened or migrated.
    #[error("failed to open store '{path}': {source}")]
    Open {
        /// The database path.
        path: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// The connection mutex was poisoned by a panicking writer.
    #[error("storage connection lock poisoned")]
    Poisoned,
}

/// Errors raised while validating read-query arguments.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    /// An aggregate name outside `count`, `min`, `max`, `sum`, `avg`.
    #[error("invalid aggregate type [{name}], allowed types: [{allowed}]")]
    InvalidAggregate {
        /// The rejected name.
        name: String,
        /// Comma-separated list of accepted names.
        allowed: String,
    },

    /// A query was issued without any aggregates or types.
    #[error("at least one {what} is required")]
    Empty {
        /// What was missing ("aggregate" or "type").
        what: &'static str,
    },

    /// The requested ordering column is not part of the selection.
    #[error("cannot order by [{column}]: not part of the selection")]
    InvalidOrder {
        /// The requested column.
        column: String,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The configuration path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::TallyConfig`].
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The configuration path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The ingest driver name is not one of the supported strategies.
    #[error("unsupported ingest driver [{0}]")]
    UnsupportedDriver(String),

    /// The storage dialect is not one this build can talk to.
    #[error("unsupported storage dialect [{0}]")]
    UnsupportedDialect(String),

    /// A numeric setting is out of range.
    #[error("invalid setting {setting}: {reason}")]
    InvalidSetting {
        /// The offending setting path.
        setting: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;
