//! Core domain model, window planning and row identity for gscsync.

use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "gscsync-core";

/// Separator between the five dimension fields of a [`RowKey`].
pub const KEY_DELIMITER: char = '|';
const KEY_ESCAPE: char = '\\';

/// Longest key the destination title property accepts. Longer keys keep a
/// prefix and end in `\#` plus the SHA-256 of the full key. `\#` is never an
/// escape pair of an ordinary key, so the two forms cannot collide.
pub const MAX_KEY_CHARS: usize = 2000;
const HASH_MARKER: &str = "\\#";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("no window requested: provide --start/--end or --days-back")]
    Missing,
    #[error("explicit window needs both start and end (got start={start:?}, end={end:?})")]
    Incomplete {
        start: Option<String>,
        end: Option<String>,
    },
    #[error("malformed date {value:?}, expected YYYY-MM-DD")]
    Malformed {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("window start {start} is after end {end}")]
    Reversed { start: NaiveDate, end: NaiveDate },
    #[error("days_back must be at least 1")]
    ZeroDaysBack,
    #[error("window arithmetic overflowed for today={today} days_back={days_back} lag_days={lag_days}")]
    OutOfRange {
        today: NaiveDate,
        days_back: u32,
        lag_days: u32,
    },
}

/// Closed date interval processed by one run; both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl SyncWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Reversed { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window covering exactly one calendar day.
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of calendar days covered, counting both ends.
    pub fn day_count(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    /// Days of the window in ascending order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Raw window parameters as handed over by the invoking process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub days_back: Option<u32>,
    pub lag_days: u32,
}

impl WindowRequest {
    pub fn explicit(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            days_back: None,
            lag_days: 0,
        }
    }

    pub fn relative(days_back: u32, lag_days: u32) -> Self {
        Self {
            start: None,
            end: None,
            days_back: Some(days_back),
            lag_days,
        }
    }

    /// Resolve the run's window. Explicit dates win over a relative window;
    /// a half-specified explicit pair is rejected rather than silently ignored.
    pub fn plan(&self, today: NaiveDate) -> Result<SyncWindow, WindowError> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => SyncWindow::new(parse_date(start)?, parse_date(end)?),
            (None, None) => {
                let days_back = self.days_back.ok_or(WindowError::Missing)?;
                relative_window(today, days_back, self.lag_days)
            }
            (start, end) => Err(WindowError::Incomplete {
                start: start.clone(),
                end: end.clone(),
            }),
        }
    }
}

fn relative_window(today: NaiveDate, days_back: u32, lag_days: u32) -> Result<SyncWindow, WindowError> {
    if days_back == 0 {
        return Err(WindowError::ZeroDaysBack);
    }
    let out_of_range = || WindowError::OutOfRange {
        today,
        days_back,
        lag_days,
    };
    let end = today
        .checked_sub_days(Days::new(lag_days.into()))
        .ok_or_else(out_of_range)?;
    let start = end
        .checked_sub_days(Days::new(u64::from(days_back) - 1))
        .ok_or_else(out_of_range)?;
    SyncWindow::new(start, end)
}

pub fn parse_date(value: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|source| WindowError::Malformed {
        value: value.to_string(),
        source,
    })
}

/// Optional dimension filters applied on the source side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionFilters {
    pub country: Option<String>,
    pub device: Option<String>,
}

impl DimensionFilters {
    pub fn is_empty(&self) -> bool {
        self.country.is_none() && self.device.is_none()
    }
}

/// One (date, query, page, country, device) tuple with its measures, as returned by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRow {
    pub date: NaiveDate,
    pub query: String,
    pub page: String,
    pub country: String,
    pub device: String,
    pub clicks: u64,
    pub impressions: u64,
    pub ctr: f64,
    pub position: f64,
}

impl AnalyticsRow {
    pub fn key(&self) -> RowKey {
        RowKey::build(
            self.date,
            &self.query,
            &self.page,
            &self.country,
            &self.device,
        )
    }
}

/// Identity of one dimensional tuple.
///
/// Fields are joined with [`KEY_DELIMITER`] after escaping any delimiter or
/// escape character they contain, so the mapping from tuples to keys is
/// injective while keys for ordinary values stay readable
/// (`2025-08-01|shoes|/a|FR|MOBILE`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn build(date: NaiveDate, query: &str, page: &str, country: &str, device: &str) -> Self {
        let date = date.format(DATE_FORMAT).to_string();
        let mut key = String::with_capacity(
            date.len() + query.len() + page.len() + country.len() + device.len() + 4,
        );
        for (idx, field) in [date.as_str(), query, page, country, device].into_iter().enumerate() {
            if idx > 0 {
                key.push(KEY_DELIMITER);
            }
            push_escaped(&mut key, field);
        }
        Self(bound_key_length(key))
    }

    /// Wrap a key read back from the destination store.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn push_escaped(out: &mut String, field: &str) {
    for c in field.chars() {
        if c == KEY_DELIMITER || c == KEY_ESCAPE {
            out.push(KEY_ESCAPE);
        }
        out.push(c);
    }
}

fn bound_key_length(key: String) -> String {
    if key.chars().count() <= MAX_KEY_CHARS {
        return key;
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    let keep = MAX_KEY_CHARS - HASH_MARKER.len() - digest.len();

    let mut prefix = String::with_capacity(keep + HASH_MARKER.len() + digest.len());
    let mut chars = key.chars();
    let mut kept = 0;
    while kept < keep {
        let Some(c) = chars.next() else { break };
        if c == KEY_ESCAPE {
            // Escape pairs stay whole.
            if kept + 2 > keep {
                break;
            }
            prefix.push(c);
            if let Some(escaped) = chars.next() {
                prefix.push(escaped);
            }
            kept += 2;
        } else {
            prefix.push(c);
            kept += 1;
        }
    }
    prefix.push_str(HASH_MARKER);
    prefix.push_str(&digest);
    prefix
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned identifier of a destination record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed attribute set written to the destination for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowProperties {
    pub key: RowKey,
    pub date: NaiveDate,
    pub query: String,
    pub page: String,
    pub country: String,
    pub device: String,
    pub clicks: u64,
    pub impressions: u64,
    pub ctr: f64,
    pub position: f64,
}

impl RowProperties {
    pub fn from_row(key: RowKey, row: &AnalyticsRow) -> Self {
        Self {
            key,
            date: row.date,
            query: row.query.clone(),
            page: row.page.clone(),
            country: row.country.clone(),
            device: row.device.clone(),
            clicks: row.clicks,
            impressions: row.impressions,
            ctr: row.ctr,
            position: row.position,
        }
    }
}

/// Persisted entity in the destination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub id: RecordId,
    pub properties: RowProperties,
}
