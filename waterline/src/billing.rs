//! Billing-cycle anchor math.
//!
//! The portal never states the account's billing day; it is inferred from
//! the day-of-month the historical billed data points land on. Absent any
//! samples the 25th is used, and that default is authoritative: the period
//! math needs some anchor to work with.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::sink::StatisticsSink;
use crate::types::Resolution;

pub const DEFAULT_BILLING_DAY: u32 = 25;

/// Billing cycle containing `today`. Before the anchor day the cycle runs
/// from last month's anchor to this month's; on or after it, from this
/// month's anchor to next month's. Anchor days past a month's end clamp to
/// the month's last day.
pub fn calculate_billing_period(today: NaiveDate, billing_day: u32) -> (NaiveDate, NaiveDate) {
    let (year, month) = (today.year(), today.month());

    if today.day() < billing_day {
        let (prev_year, prev_month) = month_before(year, month);
        (
            billing_anchor(prev_year, prev_month, billing_day),
            billing_anchor(year, month, billing_day),
        )
    } else {
        let (next_year, next_month) = month_after(year, month);
        (
            billing_anchor(year, month, billing_day),
            billing_anchor(next_year, next_month, billing_day),
        )
    }
}

/// Infer the billing day from the monthly points already in the sink.
/// All observed billed points are expected to share a day-of-month; when
/// they ever disagree the most frequent day wins, ties breaking toward the
/// most recent sample. No samples, or a failing query, falls back to the
/// default.
pub fn detect_billing_day(
    sink: &dyn StatisticsSink,
    monthly_series: &str,
    since: NaiveDateTime,
) -> u32 {
    let points = match sink.query_points(monthly_series, since, Resolution::Monthly) {
        Ok(points) => points,
        Err(err) => {
            warn!(err = %err, "billing day query failed; using default");
            return DEFAULT_BILLING_DAY;
        }
    };

    if points.is_empty() {
        debug!("no monthly samples for billing day detection; using default");
        return DEFAULT_BILLING_DAY;
    }

    let mut tally: HashMap<u32, (usize, usize)> = HashMap::new();
    for (index, point) in points.iter().enumerate() {
        let entry = tally.entry(point.timestamp.day()).or_insert((0, index));
        entry.0 += 1;
        entry.1 = index;
    }

    tally
        .into_iter()
        .max_by_key(|(_, (count, last_seen))| (*count, *last_seen))
        .map(|(day, _)| day)
        .unwrap_or(DEFAULT_BILLING_DAY)
}

fn month_before(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn month_after(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn billing_anchor(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    for day in (28..=31).rev() {
        if NaiveDate::from_ymd_opt(year, month, day).is_some() {
            return day;
        }
    }
    28
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::types::UsagePoint;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn monthly_point(y: i32, m: u32, d: u32) -> UsagePoint {
        UsagePoint {
            timestamp: date(y, m, d).and_hms_opt(0, 0, 0).unwrap(),
            usage: 1000.0,
            resolution: Resolution::Monthly,
        }
    }

    fn epoch() -> NaiveDateTime {
        date(2000, 1, 1).and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn period_before_the_billing_day() {
        let (start, end) = calculate_billing_period(date(2023, 10, 15), 25);
        assert_eq!(start, date(2023, 9, 25));
        assert_eq!(end, date(2023, 10, 25));
    }

    #[test]
    fn period_on_or_after_the_billing_day() {
        let (start, end) = calculate_billing_period(date(2023, 10, 30), 25);
        assert_eq!(start, date(2023, 10, 25));
        assert_eq!(end, date(2023, 11, 25));

        let (start, end) = calculate_billing_period(date(2023, 10, 25), 25);
        assert_eq!(start, date(2023, 10, 25));
        assert_eq!(end, date(2023, 11, 25));
    }

    #[test]
    fn period_with_custom_billing_day() {
        let (start, end) = calculate_billing_period(date(2023, 10, 10), 15);
        assert_eq!(start, date(2023, 9, 15));
        assert_eq!(end, date(2023, 10, 15));
    }

    #[test]
    fn period_spans_the_year_boundary() {
        let (start, end) = calculate_billing_period(date(2024, 1, 10), 25);
        assert_eq!(start, date(2023, 12, 25));
        assert_eq!(end, date(2024, 1, 25));

        let (start, end) = calculate_billing_period(date(2023, 12, 28), 25);
        assert_eq!(start, date(2023, 12, 25));
        assert_eq!(end, date(2024, 1, 25));
    }

    #[test]
    fn anchor_days_clamp_to_short_months() {
        let (start, end) = calculate_billing_period(date(2023, 3, 10), 31);
        assert_eq!(start, date(2023, 2, 28));
        assert_eq!(end, date(2023, 3, 31));
    }

    #[test]
    fn detects_the_common_sample_day() {
        let sink = MemorySink::new();
        sink.insert_points(
            "m",
            &[
                monthly_point(2023, 8, 25),
                monthly_point(2023, 9, 25),
                monthly_point(2023, 10, 25),
            ],
        )
        .unwrap();

        assert_eq!(detect_billing_day(&sink, "m", epoch()), 25);
    }

    #[test]
    fn disagreeing_samples_resolve_to_the_mode() {
        let sink = MemorySink::new();
        sink.insert_points(
            "m",
            &[
                monthly_point(2023, 7, 24),
                monthly_point(2023, 8, 25),
                monthly_point(2023, 9, 25),
                monthly_point(2023, 10, 25),
            ],
        )
        .unwrap();

        assert_eq!(detect_billing_day(&sink, "m", epoch()), 25);
    }

    #[test]
    fn empty_sink_falls_back_to_default() {
        let sink = MemorySink::new();
        assert_eq!(detect_billing_day(&sink, "m", epoch()), DEFAULT_BILLING_DAY);
    }

    #[test]
    fn failing_sink_query_falls_back_to_default() {
        struct BrokenSink;

        impl StatisticsSink for BrokenSink {
            fn insert_points(&self, _: &str, _: &[UsagePoint]) -> anyhow::Result<usize> {
                anyhow::bail!("store offline")
            }

            fn query_points(
                &self,
                _: &str,
                _: NaiveDateTime,
                _: Resolution,
            ) -> anyhow::Result<Vec<UsagePoint>> {
                anyhow::bail!("store offline")
            }
        }

        assert_eq!(
            detect_billing_day(&BrokenSink, "m", epoch()),
            DEFAULT_BILLING_DAY
        );
    }
}
