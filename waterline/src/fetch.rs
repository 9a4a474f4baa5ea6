//! Chunked, retried usage fetching.
//!
//! The portal silently truncates or errors on wide ranges, so daily history
//! walks backward in small windows and hourly data goes one calendar day at
//! a time (and only for days far enough in the past that the portal serves
//! them at all). All portal traffic funnels through one session guarded by
//! a mutex (the cookie jar is not safe for concurrent form dances), with a
//! lazy login flag that is cleared on any failure so the next attempt
//! re-authenticates.

use chrono::{Duration as ChronoDuration, NaiveDate};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::WaterlineConfig;
use crate::parse::parse_usage_export;
use crate::session::UsagePortal;
use crate::sink::StatisticsSink;
use crate::types::{DateRange, FetchError, Resolution, UsagePoint};

pub struct UsageFetcher {
    portal: Mutex<Box<dyn UsagePortal>>,
    logged_in: AtomicBool,
    config: WaterlineConfig,
}

impl UsageFetcher {
    pub fn new(portal: Box<dyn UsagePortal>, config: WaterlineConfig) -> Self {
        Self {
            portal: Mutex::new(portal),
            logged_in: AtomicBool::new(false),
            config,
        }
    }

    /// Authenticate now if the session is not already logged in.
    pub async fn login(&self) -> Result<(), FetchError> {
        let mut portal = self.portal.lock().await;
        self.ensure_login(&mut portal).await
    }

    async fn ensure_login(&self, portal: &mut Box<dyn UsagePortal>) -> Result<(), FetchError> {
        if self.logged_in.load(Ordering::SeqCst) {
            return Ok(());
        }
        if portal.login().await {
            self.logged_in.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(FetchError::Auth("portal rejected the login".to_string()))
        }
    }

    /// One export round-trip plus parse. An empty vector is a legitimate
    /// no-data result, not a failure.
    pub async fn fetch_range(
        &self,
        range: DateRange,
        resolution: Resolution,
    ) -> Result<Vec<UsagePoint>, FetchError> {
        let raw = {
            let mut portal = self.portal.lock().await;
            self.ensure_login(&mut portal).await?;
            match portal.fetch_export(resolution, range).await {
                Ok(raw) => raw,
                Err(err) => {
                    // Force a fresh login before the next attempt.
                    self.logged_in.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        };

        let points = parse_usage_export(&raw, resolution, range);
        debug!(count = points.len(), resolution = %resolution, range = %range, "parsed export");
        Ok(points)
    }

    /// `fetch_range` under the configured retry policy. Authentication
    /// failures are surfaced immediately; transport and export failures back
    /// off and retry until the policy is exhausted.
    pub async fn fetch_range_with_retry(
        &self,
        range: DateRange,
        resolution: Resolution,
    ) -> Result<Vec<UsagePoint>, FetchError> {
        let policy = self.config.retry;
        let mut attempt = 0u32;
        loop {
            match self.fetch_range(range, resolution).await {
                Ok(points) => return Ok(points),
                Err(err @ FetchError::Auth(_)) => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if !policy.should_retry(attempt) {
                        return Err(FetchError::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = policy.backoff(attempt - 1);
                    warn!(
                        err = %err,
                        resolution = %resolution,
                        range = %range,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "fetch failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Walk daily history backward from `end` in chunks, inserting each
    /// chunk into the sink as it completes. A chunk that exhausts its
    /// retries aborts the whole walk.
    pub async fn fetch_daily_history(
        &self,
        end: NaiveDate,
        days: i64,
        sink: &dyn StatisticsSink,
        series: &str,
    ) -> Result<usize, FetchError> {
        let start = end - ChronoDuration::days(days);
        let chunks = daily_chunks(start, end, self.config.daily_chunk_days);
        let mut inserted = 0;

        for (index, chunk) in chunks.iter().enumerate() {
            debug!(chunk = %chunk, "fetching daily chunk");
            let points = self.fetch_range_with_retry(*chunk, Resolution::Daily).await?;
            inserted += insert_absorbing_errors(sink, series, &points);

            if index + 1 < chunks.len() {
                tokio::time::sleep(self.config.daily_chunk_delay).await;
            }
        }

        Ok(inserted)
    }

    /// Fetch hourly data one calendar day at a time. A day that exhausts its
    /// retries is skipped (partial hourly coverage is acceptable), but an
    /// authentication failure aborts.
    pub async fn fetch_hourly_days(
        &self,
        dates: &[NaiveDate],
        sink: &dyn StatisticsSink,
        series: &str,
    ) -> Result<usize, FetchError> {
        let mut inserted = 0;

        for (index, day) in dates.iter().enumerate() {
            match self
                .fetch_range_with_retry(DateRange::single(*day), Resolution::Hourly)
                .await
            {
                Ok(points) => {
                    inserted += insert_absorbing_errors(sink, series, &points);
                }
                Err(err @ FetchError::Auth(_)) => return Err(err),
                Err(err) => {
                    warn!(err = %err, day = %day, "skipping hourly day after exhausted retries");
                }
            }

            if index + 1 < dates.len() {
                tokio::time::sleep(self.config.hourly_chunk_delay).await;
            }
        }

        Ok(inserted)
    }

    /// Billed/monthly data tolerates wide ranges; fetch the whole span in
    /// one retried request.
    pub async fn fetch_monthly_history(
        &self,
        end: NaiveDate,
        days: i64,
        sink: &dyn StatisticsSink,
        series: &str,
    ) -> Result<usize, FetchError> {
        let start = end - ChronoDuration::days(days);
        let range = DateRange { start, end };
        let points = self.fetch_range_with_retry(range, Resolution::Monthly).await?;
        Ok(insert_absorbing_errors(sink, series, &points))
    }
}

fn insert_absorbing_errors(
    sink: &dyn StatisticsSink,
    series: &str,
    points: &[UsagePoint],
) -> usize {
    if points.is_empty() {
        return 0;
    }
    match sink.insert_points(series, points) {
        Ok(inserted) => inserted,
        Err(err) => {
            warn!(err = %err, series, "failed to insert points into sink");
            0
        }
    }
}

// ── Chunk planners ──────────────────────────────────────────────────────

/// Backward-walking inclusive daily windows. Each chunk spans `chunk_days`
/// back from its end; consecutive chunks do not overlap.
pub fn daily_chunks(start: NaiveDate, end: NaiveDate, chunk_days: i64) -> Vec<DateRange> {
    let chunk_days = chunk_days.max(1);
    let mut chunks = Vec::new();
    let mut current_end = end;

    while current_end >= start {
        let chunk_start = std::cmp::max(current_end - ChronoDuration::days(chunk_days), start);
        chunks.push(DateRange {
            start: chunk_start,
            end: current_end,
        });
        if chunk_start == start {
            break;
        }
        current_end = chunk_start - ChronoDuration::days(1);
    }

    chunks
}

/// The calendar days to query for hourly data: one per day, newest first,
/// starting `lag_days` back from `today` (the portal does not serve hourly
/// data for the most recent days) and covering `span_days` days.
pub fn hourly_fetch_dates(today: NaiveDate, lag_days: i64, span_days: i64) -> Vec<NaiveDate> {
    (lag_days..lag_days + span_days.max(0))
        .map(|offset| today - ChronoDuration::days(offset))
        .collect()
}
