//! Tab-delimited usage export parsing.
//!
//! The portal's export is a header line followed by `<timestamp>\t<gallons>`
//! rows. The timestamp token format varies by resolution, and the bare forms
//! omit parts of the date that have to be inferred from the requested range:
//! hourly rows carry only an hour-of-day, daily rows may omit the year, and
//! monthly rows may arrive as "Dec 23". Row-level problems drop the row,
//! never the whole parse.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use tracing::debug;

use crate::types::{DateRange, Resolution, UsagePoint};

/// Convert raw export bytes into normalized usage points.
///
/// Pure text-to-data transformation. Undecodable bytes are substituted, the
/// header line is discarded, and every surviving row is normalized to the
/// start of its resolution bucket.
pub fn parse_usage_export(raw: &[u8], resolution: Resolution, range: DateRange) -> Vec<UsagePoint> {
    let text = String::from_utf8_lossy(raw);
    let mut points = Vec::new();

    for line in text.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split('\t');
        let (Some(timestamp_token), Some(usage_token)) = (fields.next(), fields.next()) else {
            continue;
        };

        let Ok(usage) = usage_token.trim().parse::<f64>() else {
            debug!(row = line, "skipping row with unparseable usage value");
            continue;
        };
        if usage < 0.0 {
            debug!(row = line, "skipping row with negative usage value");
            continue;
        }

        let timestamp = match resolution {
            Resolution::Hourly => parse_hourly_timestamp(timestamp_token.trim(), range),
            Resolution::Daily => {
                parse_daily_timestamp(timestamp_token.trim(), range).map(start_of_day)
            }
            Resolution::Monthly => parse_monthly_timestamp(timestamp_token.trim()).map(start_of_day),
        };

        let Some(timestamp) = timestamp else {
            debug!(
                token = timestamp_token,
                resolution = %resolution,
                "skipping row with unresolvable timestamp"
            );
            continue;
        };

        points.push(UsagePoint {
            timestamp,
            usage,
            resolution,
        });
    }

    points
}

// ── Per-resolution timestamp policies ───────────────────────────────────

/// Full `MM/DD/YYYY HH:MM:SS` first; otherwise a bare `1 PM` style token
/// anchored to the requested range's end date. The portal omits the date on
/// hourly rows and always refers to the queried day.
fn parse_hourly_timestamp(token: &str, range: DateRange) -> Option<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(token, "%m/%d/%Y %H:%M:%S") {
        return dt.date().and_hms_opt(dt.hour(), 0, 0);
    }

    let upper = token.to_uppercase();
    let mut parts = upper.split_whitespace();
    let hour_token = parts.next()?;
    let meridiem = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let hour: u32 = hour_token.parse().ok()?;
    let hour = match meridiem {
        "PM" if hour != 12 => hour + 12,
        "AM" if hour == 12 => 0,
        "AM" | "PM" => hour,
        _ => return None,
    };

    range.end.and_hms_opt(hour, 0, 0)
}

/// Full `MM/DD/YYYY` first; otherwise bare `MM/DD` with the year taken from
/// the requested start date, corrected when the range spans New Year's:
/// a January token in a December-starting range belongs to the next year,
/// and a December token in a January-ending range to the previous one.
fn parse_daily_timestamp(token: &str, range: DateRange) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(token, "%m/%d/%Y") {
        return Some(date);
    }

    let (month_token, day_token) = token.split_once('/')?;
    let month: u32 = month_token.trim().parse().ok()?;
    let day: u32 = day_token.trim().parse().ok()?;

    let inferred_year = range.start.year();
    let date = NaiveDate::from_ymd_opt(inferred_year, month, day)?;

    if date < range.start && range.start.month() == 12 && month == 1 {
        return NaiveDate::from_ymd_opt(inferred_year + 1, month, day);
    }
    if date > range.end && range.end.month() == 1 && month == 12 {
        return NaiveDate::from_ymd_opt(inferred_year - 1, month, day);
    }

    Some(date)
}

/// `MM/YYYY` first; otherwise an abbreviated month name plus two-digit year
/// ("Dec 23"), mapped into the 2000s and anchored to the first of the month.
fn parse_monthly_timestamp(token: &str) -> Option<NaiveDate> {
    if let Some((month_token, year_token)) = token.split_once('/') {
        let month: u32 = month_token.trim().parse().ok()?;
        let year: i32 = year_token.trim().parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, 1);
    }

    let mut parts = token.split_whitespace();
    let month_name = parts.next()?;
    let year_token = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let month = month_from_abbrev(month_name)?;
    let year = 2000 + year_token.parse::<i32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn month_from_abbrev(token: &str) -> Option<u32> {
    match token.to_ascii_lowercase().as_str() {
        "jan" => Some(1),
        "feb" => Some(2),
        "mar" => Some(3),
        "apr" => Some(4),
        "may" => Some(5),
        "jun" => Some(6),
        "jul" => Some(7),
        "aug" => Some(8),
        "sep" => Some(9),
        "oct" => Some(10),
        "nov" => Some(11),
        "dec" => Some(12),
        _ => None,
    }
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}
