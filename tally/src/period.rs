//! Period calendar for tally rollups.
//!
//! Every [`Period`] is a fixed dashboard window ("the last hour", "the last
//! quarter", ...) split into a fixed number of buckets. Entries are rolled up
//! into one aggregate row per bucket for every period at ingest time, and the
//! retention cutoff of each period decides when its rows are trimmed.
//!
//! All functions here are pure: they take timestamps (UTC epoch seconds) and
//! return timestamps. "Now" is always passed in explicitly.
//!
//! | Period        | Bucket unit          | Buckets kept |
//! |---------------|----------------------|--------------|
//! | `Hour`        | 1 minute             | 60           |
//! | `SixHours`    | 30 minutes           | 12           |
//! | `TwelveHours` | 1 hour               | 12           |
//! | `Day`         | 1 hour               | 24           |
//! | `Week`        | 1 day                | 7            |
//! | `Month`       | 1 day                | 30           |
//! | `Quarter`     | ISO week (Monday)    | 13           |
//! | `HalfYear`    | calendar month       | 6            |
//! | `Year`        | calendar month       | 12           |
//! | `TaxYear`     | tax month (6th)      | 12           |

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// 1970-01-05, the first Monday after the epoch.
const FIRST_MONDAY: i64 = 4 * DAY;

/// Day of the month on which UK tax months (and the tax year) begin.
const TAX_MONTH_START_DAY: u32 = 6;

/// A rollup granularity.
///
/// The set is closed: every entry tagged with an aggregation feeds one row
/// per period, so adding a period multiplies write volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    /// Last hour in one-minute buckets.
    Hour,
    /// Last six hours in half-hour buckets.
    SixHours,
    /// Last twelve hours in hourly buckets.
    TwelveHours,
    /// Last day in hourly buckets.
    Day,
    /// Last week in daily buckets.
    Week,
    /// Last thirty days in daily buckets.
    Month,
    /// Last thirteen ISO weeks in weekly buckets.
    Quarter,
    /// Last six calendar months in monthly buckets.
    HalfYear,
    /// Last twelve calendar months in monthly buckets.
    Year,
    /// Last twelve UK tax months (6th to 5th) in tax-month buckets.
    TaxYear,
}

/// How a period's buckets are aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    /// Fixed-width buckets aligned to `offset` seconds past the epoch.
    Fixed { width: i64, offset: i64 },
    /// Calendar months starting on `day`.
    Month { day: u32 },
}

/// A sliding `[start, end)` range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// First second inside the window.
    pub start: i64,
    /// First second after the window.
    pub end: i64,
}

impl Window {
    /// Returns true if `timestamp` falls inside the window.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

impl Period {
    /// Every period, shortest first.
    pub const ALL: [Period; 10] = [
        Period::Hour,
        Period::SixHours,
        Period::TwelveHours,
        Period::Day,
        Period::Week,
        Period::Month,
        Period::Quarter,
        Period::HalfYear,
        Period::Year,
        Period::TaxYear,
    ];

    /// Stable identifier stored in the `period` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::SixHours => "six_hours",
            Self::TwelveHours => "twelve_hours",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::HalfYear => "half_year",
            Self::Year => "year",
            Self::TaxYear => "tax_year",
        }
    }

    /// Parses an identifier produced by [`Period::as_str`].
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == id)
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Hour => "1 hour",
            Self::SixHours => "6 hours",
            Self::TwelveHours => "12 hours",
            Self::Day => "24 hours",
            Self::Week => "7 days",
            Self::Month => "30 days",
            Self::Quarter => "13 weeks",
            Self::HalfYear => "6 months",
            Self::Year => "12 months",
            Self::TaxYear => "tax year",
        }
    }

    fn unit(self) -> Unit {
        match self {
            Self::Hour => Unit::Fixed {
                width: MINUTE,
                offset: 0,
            },
            Self::SixHours => Unit::Fixed {
                width: 30 * MINUTE,
                offset: 0,
            },
            Self::TwelveHours | Self::Day => Unit::Fixed {
                width: HOUR,
                offset: 0,
            },
            Self::Week | Self::Month => Unit::Fixed {
                width: DAY,
                offset: 0,
            },
            Self::Quarter => Unit::Fixed {
                width: WEEK,
                offset: FIRST_MONDAY,
            },
            Self::HalfYear | Self::Year => Unit::Month { day: 1 },
            Self::TaxYear => Unit::Month {
                day: TAX_MONTH_START_DAY,
            },
        }
    }

    /// Number of trailing buckets kept for this period, current bucket
    /// included.
    pub fn max_buckets_retained(self) -> u32 {
        match self {
            Self::Hour => 60,
            Self::SixHours | Self::TwelveHours | Self::Year | Self::TaxYear => 12,
            Self::Day => 24,
            Self::Week => 7,
            Self::Month => 30,
            Self::Quarter => 13,
            Self::HalfYear => 6,
        }
    }

    /// Width of one bucket in seconds.
    ///
    /// Month-aligned periods report a nominal 30-day width; their bucket
    /// arithmetic always goes through the calendar instead.
    pub fn bucket_width_seconds(self) -> i64 {
        match self.unit() {
            Unit::Fixed { width, .. } => width,
            Unit::Month { .. } => 30 * DAY,
        }
    }

    /// `strftime` pattern used for bucket labels.
    ///
    /// Every pattern sorts lexically in chronological order.
    pub fn display_format(self) -> &'static str {
        match self {
            Self::Hour => "%Y-%m-%d %H:%M:%S",
            Self::SixHours | Self::TwelveHours | Self::Day => "%Y-%m-%d %H:%M",
            Self::Week | Self::Month | Self::Quarter | Self::TaxYear => "%Y-%m-%d",
            Self::HalfYear | Self::Year => "%Y-%m",
        }
    }

    /// Formats a bucket start for display.
    pub fn format(self, bucket: i64) -> String {
        datetime(bucket).format(self.display_format()).to_string()
    }

    /// Rounds `timestamp` down to the start of its bucket.
    pub fn bucket_of(self, timestamp: i64) -> i64 {
        match self.unit() {
            Unit::Fixed { width, offset } => timestamp - (timestamp - offset).rem_euclid(width),
            Unit::Month { day } => {
                let dt = datetime(timestamp);
                let (year, month) = if dt.day() >= day {
                    (dt.year(), dt.month())
                } else {
                    previous_month(dt.year(), dt.month())
                };
                month_start(year, month, day).unwrap_or(timestamp)
            }
        }
    }

    /// Moves a bucket start by `n` buckets (negative moves backwards).
    ///
    /// `bucket` must already be aligned.
    pub fn step(self, bucket: i64, n: i64) -> i64 {
        match self.unit() {
            Unit::Fixed { width, .. } => bucket + n * width,
            Unit::Month { .. } => shift_months(bucket, n),
        }
    }

    /// Start of the bucket containing `now`.
    pub fn current_bucket(self, now: i64) -> i64 {
        self.bucket_of(now)
    }

    /// Retention cutoff: the current bucket minus
    /// [`max_buckets_retained`](Self::max_buckets_retained) buckets.
    ///
    /// Rows whose bucket is at or before this cutoff are trimmed, and new
    /// entries that would land at or before it are not aggregated.
    pub fn oldest_retained_bucket(self, now: i64) -> i64 {
        self.step(
            self.current_bucket(now),
            -i64::from(self.max_buckets_retained()),
        )
    }

    /// Oldest bucket that lies wholly inside [`recent_window`](Self::recent_window).
    pub fn first_closed_bucket(self, now: i64) -> i64 {
        self.step(
            self.current_bucket(now),
            1 - i64::from(self.max_buckets_retained()),
        )
    }

    /// The `n` most recent bucket starts at or before `now`, oldest first.
    pub fn recent_buckets(self, now: i64, n: u32) -> Vec<i64> {
        let current = self.current_bucket(now);
        (0..i64::from(n))
            .rev()
            .map(|back| self.step(current, -back))
            .collect()
    }

    /// The trailing window covered by this period, ending at `now`
    /// (inclusive) and not snapped to bucket boundaries.
    pub fn recent_window(self, now: i64) -> Window {
        let n = i64::from(self.max_buckets_retained());
        let back = match self.unit() {
            Unit::Fixed { width, .. } => now - n * width,
            Unit::Month { .. } => shift_months(now, -n),
        };
        Window {
            start: back + 1,
            end: now + 1,
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_id(s).ok_or_else(|| {
            let allowed: Vec<_> = Self::ALL.iter().map(|p| p.as_str()).collect();
            format!("unknown period [{s}], allowed: [{}]", allowed.join(", "))
        })
    }
}

/// Converts epoch seconds to a UTC datetime.
///
/// Timestamps outside chrono's representable range collapse to the epoch.
fn datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn month_start(year: i32, month: u32, day: u32) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// `timestamp` moved back by `months` calendar months.
pub fn months_before(timestamp: i64, months: u32) -> i64 {
    shift_months(timestamp, -i64::from(months))
}

/// Shifts a timestamp by whole calendar months, keeping the time of day and
/// clamping the day to the end of shorter months.
fn shift_months(timestamp: i64, n: i64) -> i64 {
    let dt = datetime(timestamp);
    let months = Months::new(u32::try_from(n.unsigned_abs()).unwrap_or(u32::MAX));
    let shifted = if n >= 0 {
        dt.checked_add_months(months)
    } else {
        dt.checked_sub_months(months)
    };
    shifted.map_or(timestamp, |dt| dt.timestamp())
}
