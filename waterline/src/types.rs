use anyhow::{ensure, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Resolution ──────────────────────────────────────────────────────────

/// Granularity of a usage data point. Monthly points come from the billed
/// usage page and land on billing-cycle boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Hourly,
    Daily,
    Monthly,
}

impl Resolution {
    /// Portal page serving this resolution's usage form and export.
    pub fn page(&self) -> &'static str {
        match self {
            Resolution::Hourly => "USE_HOURLY.aspx",
            Resolution::Daily => "USE_DAILY.aspx",
            Resolution::Monthly => "USE_BILLED.aspx",
        }
    }

    /// Value of the export type field the portal expects on the download POST.
    pub fn export_label(&self) -> &'static str {
        match self {
            Resolution::Hourly => "Hourly+Use",
            Resolution::Daily => "Daily+Use",
            Resolution::Monthly => "Billed+Use",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Hourly => "hourly",
            Resolution::Daily => "daily",
            Resolution::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Core data types ─────────────────────────────────────────────────────

/// One normalized usage reading. `timestamp` is portal-local and sits on the
/// start of its resolution bucket (hour boundary, midnight, first-of-month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePoint {
    pub timestamp: NaiveDateTime,
    pub usage: f64,
    pub resolution: Resolution,
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        ensure!(start <= end, "date range start {start} is after end {end}");
        Ok(Self { start, end })
    }

    /// Range covering exactly one calendar day.
    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ── Credentials ─────────────────────────────────────────────────────────

/// Portal account credentials. Never logged in full; diagnostics only ever
/// see `username_prefix()`.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// First three characters of the username, for log lines.
    pub fn username_prefix(&self) -> String {
        let prefix: String = self.username.chars().take(3).collect();
        format!("{prefix}***")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username_prefix())
            .field("password", &"***")
            .finish()
    }
}

// ── Error taxonomy ──────────────────────────────────────────────────────

/// Failures a fetch can surface. An empty point list is success, not an
/// error; these variants all mean the data was never obtained.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("export rejected, landed on {url}")]
    ExportRejected { url: String },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

// ── Per-account context ─────────────────────────────────────────────────

/// Mutable per-account coordinator state. One instance per configured
/// account; guarded by the coordinator, never shared across accounts.
#[derive(Debug, Default, Clone)]
pub struct AccountState {
    pub billing_day: Option<u32>,
    pub last_backfill: Option<NaiveDateTime>,
    pub historical_fetched: bool,
}

/// Sink series ids for one account, one per resolution.
#[derive(Debug, Clone)]
pub struct SeriesIds {
    pub hourly: String,
    pub daily: String,
    pub monthly: String,
}

impl SeriesIds {
    pub fn for_account(username: &str) -> Self {
        let slug = account_slug(username);
        Self {
            hourly: format!("water:{slug}:hourly"),
            daily: format!("water:{slug}:daily"),
            monthly: format!("water:{slug}:monthly"),
        }
    }

    pub fn for_resolution(&self, resolution: Resolution) -> &str {
        match resolution {
            Resolution::Hourly => &self.hourly,
            Resolution::Daily => &self.daily,
            Resolution::Monthly => &self.monthly,
        }
    }
}

fn account_slug(username: &str) -> String {
    username
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
