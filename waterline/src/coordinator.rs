//! Per-account update coordination.
//!
//! One coordinator per configured account owns the session, the per-account
//! state flags, and the series ids. The periodic `update` cycle and the
//! background historical backfill both funnel through the fetcher's session
//! mutex, so they interleave by queueing rather than running concurrently.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::billing::{calculate_billing_period, detect_billing_day};
use crate::config::WaterlineConfig;
use crate::fetch::{hourly_fetch_dates, UsageFetcher};
use crate::session::UsagePortal;
use crate::sink::StatisticsSink;
use crate::types::{AccountState, DateRange, FetchError, Resolution, SeriesIds};

/// What one successful update cycle reports.
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub daily_usage: f64,
    pub latest_hourly_usage: f64,
    pub month_to_date_usage: f64,
    pub billing_cycle_usage: f64,
    pub billing_cycle_start: NaiveDate,
    pub billing_cycle_end: NaiveDate,
    pub last_updated: NaiveDateTime,
}

pub struct Coordinator {
    config: WaterlineConfig,
    fetcher: UsageFetcher,
    sink: Arc<dyn StatisticsSink>,
    series: SeriesIds,
    state: Mutex<AccountState>,
    backfill_in_flight: AtomicBool,
}

impl Coordinator {
    pub fn new(
        config: WaterlineConfig,
        portal: Box<dyn UsagePortal>,
        sink: Arc<dyn StatisticsSink>,
        account: &str,
    ) -> Self {
        Self {
            fetcher: UsageFetcher::new(portal, config.clone()),
            config,
            sink,
            series: SeriesIds::for_account(account),
            state: Mutex::new(AccountState::default()),
            backfill_in_flight: AtomicBool::new(false),
        }
    }

    /// Run one update cycle: authenticate, catch up on missing recent data,
    /// then fetch and report the current readings. Only authentication or a
    /// failed current-reading fetch fails the cycle; a failed cycle inserts
    /// nothing inconsistent and is safe to retry on the next tick.
    pub async fn update(&self, now: NaiveDateTime) -> Result<UsageReport, FetchError> {
        self.fetcher.login().await?;

        self.incremental_backfill(now).await;

        let today = now.date();
        let hourly_points = self
            .fetcher
            .fetch_range(DateRange::single(today), Resolution::Hourly)
            .await?;
        let daily_usage: f64 = hourly_points.iter().map(|point| point.usage).sum();
        let latest_hourly_usage = hourly_points.last().map_or(0.0, |point| point.usage);

        if !hourly_points.is_empty() {
            if let Err(err) = self.sink.insert_points(&self.series.hourly, &hourly_points) {
                warn!(err = %err, "failed to insert current hourly points");
            }
        }

        let month_start = today.with_day(1).unwrap_or(today);
        let month_to_date_usage = self.summed_daily(month_start, today).await;

        let billing_day = self.billing_day();
        let (billing_cycle_start, billing_cycle_end) = calculate_billing_period(today, billing_day);
        let billing_cycle_usage = self.summed_daily(billing_cycle_start, today).await;

        Ok(UsageReport {
            daily_usage,
            latest_hourly_usage,
            month_to_date_usage,
            billing_cycle_usage,
            billing_cycle_start,
            billing_cycle_end,
            last_updated: now,
        })
    }

    /// Catch-up pass over the recent past, at most once per backfill
    /// interval: re-fetch the last month of daily data and the hourly days
    /// the portal has since made available. Failures are absorbed; the
    /// next eligible cycle tries again.
    async fn incremental_backfill(&self, now: NaiveDateTime) {
        {
            let state = self.state();
            if let Some(last) = state.last_backfill {
                if now - last < ChronoDuration::hours(self.config.backfill_interval_hours) {
                    return;
                }
            }
        }

        debug!("checking for missing data to backfill");
        let today = now.date();

        if let Err(err) = self
            .fetcher
            .fetch_daily_history(
                today,
                self.config.backfill_daily_days,
                self.sink.as_ref(),
                &self.series.daily,
            )
            .await
        {
            warn!(err = %err, "daily backfill failed");
        }

        let dates = hourly_fetch_dates(
            today,
            self.config.hourly_lag_days,
            self.config.backfill_hourly_days,
        );
        if let Err(err) = self
            .fetcher
            .fetch_hourly_days(&dates, self.sink.as_ref(), &self.series.hourly)
            .await
        {
            warn!(err = %err, "hourly backfill failed");
        }

        self.state().last_backfill = Some(now);
    }

    /// First-run deep backfill: two years of billed and daily history plus a
    /// month of hourly detail, each batch inserted as it completes. The
    /// historical flag is only set once every phase finishes, so a partial
    /// failure is retried by a later cycle.
    pub async fn run_historical_backfill(&self, now: NaiveDateTime) -> Result<(), FetchError> {
        if self.state().historical_fetched {
            return Ok(());
        }

        if self.has_recent_history(now) {
            info!("sink already holds recent daily history; skipping historical fetch");
            self.state().historical_fetched = true;
            return Ok(());
        }

        self.fetcher.login().await?;
        info!("fetching historical water usage data");
        let today = now.date();

        let monthly = self
            .fetcher
            .fetch_monthly_history(
                today,
                self.config.history_days,
                self.sink.as_ref(),
                &self.series.monthly,
            )
            .await?;
        info!(points = monthly, "fetched monthly billing history");

        let daily = self
            .fetcher
            .fetch_daily_history(
                today,
                self.config.history_days,
                self.sink.as_ref(),
                &self.series.daily,
            )
            .await?;
        info!(points = daily, "fetched daily history");

        let dates = hourly_fetch_dates(
            today,
            self.config.hourly_lag_days,
            self.config.hourly_history_days,
        );
        let hourly = self
            .fetcher
            .fetch_hourly_days(&dates, self.sink.as_ref(), &self.series.hourly)
            .await?;
        info!(points = hourly, "fetched hourly history");

        {
            let mut state = self.state();
            state.historical_fetched = true;
            state.last_backfill = Some(now);
        }
        Ok(())
    }

    /// Spawn the historical backfill as a supervised background task after
    /// the configured startup delay. Returns `None` when history is already
    /// fetched or a backfill task is still in flight. Aborting the returned
    /// handle is safe: inserts are incremental and the flag stays unset.
    pub fn maybe_spawn_historical_backfill(
        self: &Arc<Self>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.state().historical_fetched {
            return None;
        }
        if self.backfill_in_flight.swap(true, Ordering::SeqCst) {
            return None;
        }

        let coordinator = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(coordinator.config.startup_delay).await;
            info!("starting background historical data fetch");
            let now = chrono::Local::now().naive_local();
            match coordinator.run_historical_backfill(now).await {
                Ok(()) => info!("background historical data fetch complete"),
                Err(err) => {
                    warn!(err = %err, "historical fetch failed; will retry on a later cycle");
                }
            }
            coordinator.backfill_in_flight.store(false, Ordering::SeqCst);
        }))
    }

    fn has_recent_history(&self, now: NaiveDateTime) -> bool {
        let since = now - ChronoDuration::days(365);
        match self
            .sink
            .query_points(&self.series.daily, since, Resolution::Daily)
        {
            Ok(points) if points.len() >= self.config.min_history_points => {
                debug!(count = points.len(), "found existing daily statistics");
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(err = %err, "failed to check for existing history");
                false
            }
        }
    }

    fn billing_day(&self) -> u32 {
        if let Some(day) = self.state().billing_day {
            return day;
        }
        // Every billed point ever recorded is a sample.
        let day = detect_billing_day(self.sink.as_ref(), &self.series.monthly, NaiveDateTime::MIN);
        debug!(day, "detected billing day");
        self.state().billing_day = Some(day);
        day
    }

    async fn summed_daily(&self, start: NaiveDate, end: NaiveDate) -> f64 {
        if start > end {
            return 0.0;
        }
        match self
            .fetcher
            .fetch_range(DateRange { start, end }, Resolution::Daily)
            .await
        {
            Ok(points) => points.iter().map(|point| point.usage).sum(),
            Err(err) => {
                warn!(err = %err, "failed to fetch daily usage for period sum");
                0.0
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use crate::types::UsagePoint;
    use async_trait::async_trait;
    use std::time::Duration;

    const HOURLY_PAYLOAD: &[u8] = b"Hour\tGallons\n1 AM\t2.5\n2 AM\t3.5\n";
    const DAILY_PAYLOAD: &[u8] = b"Date\tGallons\n10/10/2023\t55.0\n";
    const MONTHLY_PAYLOAD: &[u8] = b"Month\tGallons\n08/2023\t1200.0\n09/2023\t1100.0\n";

    /// Portal double serving canned exports per resolution.
    struct ScriptedPortal {
        calls: Arc<Mutex<Vec<(Resolution, DateRange)>>>,
        accept_login: bool,
    }

    #[async_trait]
    impl UsagePortal for ScriptedPortal {
        async fn login(&mut self) -> bool {
            self.accept_login
        }

        async fn fetch_export(
            &mut self,
            resolution: Resolution,
            range: DateRange,
        ) -> Result<Vec<u8>, FetchError> {
            self.calls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((resolution, range));
            let payload = match resolution {
                Resolution::Hourly => HOURLY_PAYLOAD,
                Resolution::Daily => DAILY_PAYLOAD,
                Resolution::Monthly => MONTHLY_PAYLOAD,
            };
            Ok(payload.to_vec())
        }
    }

    fn test_config() -> WaterlineConfig {
        let mut config = WaterlineConfig::from_env().expect("config");
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        };
        config.daily_chunk_delay = Duration::ZERO;
        config.hourly_chunk_delay = Duration::ZERO;
        config.startup_delay = Duration::ZERO;
        config.history_days = 10;
        config.hourly_history_days = 2;
        config.backfill_daily_days = 5;
        config.backfill_hourly_days = 2;
        config
    }

    struct Harness {
        coordinator: Coordinator,
        sink: Arc<MemorySink>,
        calls: Arc<Mutex<Vec<(Resolution, DateRange)>>>,
    }

    fn harness(accept_login: bool) -> Harness {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let portal = ScriptedPortal {
            calls: calls.clone(),
            accept_login,
        };
        let sink = Arc::new(MemorySink::new());
        let coordinator = Coordinator::new(
            test_config(),
            Box::new(portal),
            sink.clone(),
            "test-account",
        );
        Harness {
            coordinator,
            sink,
            calls,
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 10, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn call_count(harness: &Harness) -> usize {
        harness
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    #[tokio::test]
    async fn historical_backfill_inserts_all_resolutions_in_order() {
        let h = harness(true);
        h.coordinator
            .run_historical_backfill(now())
            .await
            .expect("historical backfill");

        let series = SeriesIds::for_account("test-account");
        assert_eq!(h.sink.series_len(&series.monthly), 2);
        assert!(h.sink.series_len(&series.daily) >= 1);
        // Two hourly days, two canned rows each.
        assert_eq!(h.sink.series_len(&series.hourly), 4);

        let log = h.sink.insert_log();
        assert_eq!(log.first(), Some(&series.monthly));
        let first_daily = log.iter().position(|s| s == &series.daily).expect("daily");
        let first_hourly = log.iter().position(|s| s == &series.hourly).expect("hourly");
        assert!(first_daily < first_hourly);
        assert!(h.coordinator.state().historical_fetched);
    }

    #[tokio::test]
    async fn historical_backfill_is_one_shot() {
        let h = harness(true);
        h.coordinator.run_historical_backfill(now()).await.unwrap();
        let after_first = call_count(&h);
        h.coordinator.run_historical_backfill(now()).await.unwrap();
        assert_eq!(call_count(&h), after_first);
    }

    #[tokio::test]
    async fn historical_backfill_skips_when_history_already_present() {
        let h = harness(true);
        let series = SeriesIds::for_account("test-account");

        // A year's worth of daily points ending just before "now".
        let mut points = Vec::new();
        for offset in 1..=320 {
            let day = now().date() - ChronoDuration::days(offset);
            points.push(UsagePoint {
                timestamp: day.and_hms_opt(0, 0, 0).unwrap(),
                usage: 40.0,
                resolution: Resolution::Daily,
            });
        }
        h.sink.insert_points(&series.daily, &points).unwrap();

        h.coordinator.run_historical_backfill(now()).await.unwrap();
        assert_eq!(call_count(&h), 0);
        assert!(h.coordinator.state().historical_fetched);
    }

    #[tokio::test]
    async fn incremental_backfill_is_throttled_to_the_interval() {
        let h = harness(true);

        h.coordinator.incremental_backfill(now()).await;
        let after_first = call_count(&h);
        assert!(after_first > 0);

        h.coordinator.incremental_backfill(now()).await;
        assert_eq!(call_count(&h), after_first);

        let later = now() + ChronoDuration::hours(25);
        h.coordinator.incremental_backfill(later).await;
        assert!(call_count(&h) > after_first);
    }

    #[tokio::test]
    async fn update_reports_current_figures() {
        let h = harness(true);
        let report = h.coordinator.update(now()).await.expect("update");

        assert_eq!(report.daily_usage, 6.0);
        assert_eq!(report.latest_hourly_usage, 3.5);
        assert_eq!(report.month_to_date_usage, 55.0);
        assert_eq!(report.billing_cycle_usage, 55.0);
        // No monthly samples in the sink, so the default anchor applies.
        assert_eq!(report.billing_cycle_start, NaiveDate::from_ymd_opt(2023, 9, 25).unwrap());
        assert_eq!(report.billing_cycle_end, NaiveDate::from_ymd_opt(2023, 10, 25).unwrap());
        assert_eq!(report.last_updated, now());

        // Today's hourly points were republished into the sink, alongside
        // the two backfilled hourly days.
        let series = SeriesIds::for_account("test-account");
        assert_eq!(h.sink.series_len(&series.hourly), 6);
    }

    #[tokio::test]
    async fn update_fails_the_cycle_on_rejected_login() {
        let h = harness(false);
        let err = h.coordinator.update(now()).await.expect_err("login rejected");
        assert!(matches!(err, FetchError::Auth(_)));
        assert_eq!(call_count(&h), 0);
    }

    #[tokio::test]
    async fn billing_day_detection_uses_sink_samples_and_caches() {
        let h = harness(true);
        let series = SeriesIds::for_account("test-account");
        // Samples off the default day prove detection actually ran.
        let samples: Vec<UsagePoint> = [(2023, 7), (2023, 8), (2023, 9)]
            .into_iter()
            .map(|(y, m)| UsagePoint {
                timestamp: NaiveDate::from_ymd_opt(y, m, 15)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap(),
                usage: 1200.0,
                resolution: Resolution::Monthly,
            })
            .collect();
        h.sink.insert_points(&series.monthly, &samples).unwrap();

        assert_eq!(h.coordinator.billing_day(), 15);
        assert_eq!(h.coordinator.state().billing_day, Some(15));
        // Cached: a second call returns without re-querying.
        assert_eq!(h.coordinator.billing_day(), 15);
    }
}
