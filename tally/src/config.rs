//! Runtime configuration for a tally installation.
//!
//! Every field has a default, so an empty JSON object (`{}`) is a valid
//! configuration. Backend names stay plain strings at the serde layer and are
//! resolved into closed enums by [`TallyConfig::validate`], so an unknown
//! driver or dialect is reported as such rather than as a parse failure.
//!
//! ```json
//! {
//!   "enabled": true,
//!   "storage": { "path": "tally.sqlite3", "dialect": "sqlite", "chunk": 1000 },
//!   "ingest": {
//!     "driver": "storage",
//!     "buffer": 5000,
//!     "trim": { "lottery": [1, 1000], "keep_months": 12 }
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::period;

/// Fixed horizon for raw entries and values: one calendar year.
///
/// Independent of every period's own retention.
pub const DEFAULT_KEEP_MONTHS: u32 = 12;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Master switch. When false, ingest uses the null driver.
    pub enabled: bool,
    /// Where and how samples are persisted.
    pub storage: StorageConfig,
    /// Buffering and ingest strategy.
    pub ingest: IngestConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file.
    pub path: PathBuf,
    /// SQL dialect; only `sqlite` is supported.
    pub dialect: String,
    /// Rows per multi-row statement.
    pub chunk: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tally.sqlite3"),
            dialect: "sqlite".to_string(),
            chunk: 1000,
        }
    }
}

/// Ingest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// `storage`, `offloaded` or `null`.
    pub driver: String,
    /// Queued samples tolerated before the collector ingests on its own.
    pub buffer: usize,
    /// Trim lottery and raw retention.
    pub trim: TrimConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            driver: "storage".to_string(),
            buffer: 5000,
            trim: TrimConfig::default(),
        }
    }
}

/// Trim settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// `[wins, out_of]`: trim after an ingest with odds `wins / out_of`.
    pub lottery: [u32; 2],
    /// Raw entries and values older than this many calendar months are
    /// trimmed.
    pub keep_months: u32,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            lottery: [1, 1000],
            keep_months: DEFAULT_KEEP_MONTHS,
        }
    }
}

impl TrimConfig {
    /// Newest timestamp at which raw entries and values are trimmed.
    ///
    /// Calendar subtraction, so the horizon spans 366 days across a leap day.
    pub fn horizon(&self, now: i64) -> i64 {
        period::months_before(now, self.keep_months)
    }
}

/// Ingest strategy selected by [`IngestConfig::driver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// Write batches straight to storage.
    Storage,
    /// Queue batches for a later digest.
    Offloaded,
    /// Discard everything.
    Null,
}

impl Driver {
    fn parse(name: &str) -> std::result::Result<Self, ConfigError> {
        match name {
            "storage" => Ok(Self::Storage),
            "offloaded" => Ok(Self::Offloaded),
            "null" => Ok(Self::Null),
            other => Err(ConfigError::UnsupportedDriver(other.to_string())),
        }
    }
}

impl TallyConfig {
    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is not valid JSON
    /// for this type, or fails [`validate`](Self::validate).
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks backend names and numeric ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.storage.dialect != "sqlite" {
            return Err(ConfigError::UnsupportedDialect(self.storage.dialect.clone()).into());
        }
        Driver::parse(&self.ingest.driver)?;

        if self.storage.chunk == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "storage.chunk",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let [wins, out_of] = self.ingest.trim.lottery;
        if out_of == 0 || wins > out_of {
            return Err(ConfigError::InvalidSetting {
                setting: "ingest.trim.lottery",
                reason: format!("odds {wins}/{out_of} are not a probability"),
            }
            .into());
        }

        if self.ingest.trim.keep_months == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "ingest.trim.keep_months",
                reason: "must be positive".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// The ingest strategy to build; [`Driver::Null`] when disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedDriver`] for an unknown name.
    pub fn driver(&self) -> Result<Driver> {
        let driver = Driver::parse(&self.ingest.driver)?;
        Ok(if self.enabled { driver } else { Driver::Null })
    }
}
