use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

// ── Default portal endpoint ─────────────────────────────────────────────

const DEFAULT_BASE_URL: &str = "https://myaccount-water.sfpuc.org";

/// Usage point store relative to home.
const DEFAULT_STATE_REL: &str = ".waterline/usage_points.jsonl";

// ── Default server limits (empirical, not documented contracts) ─────────

const DEFAULT_DAILY_CHUNK_DAYS: i64 = 7;
const DEFAULT_HOURLY_LAG_DAYS: i64 = 2;
const DEFAULT_HISTORY_DAYS: i64 = 730;
const DEFAULT_HOURLY_HISTORY_DAYS: i64 = 30;
const DEFAULT_BACKFILL_DAILY_DAYS: i64 = 30;
const DEFAULT_BACKFILL_HOURLY_DAYS: i64 = 7;
const DEFAULT_DAILY_CHUNK_DELAY_MS: u64 = 500;
const DEFAULT_HOURLY_CHUNK_DELAY_MS: u64 = 300;

// ── Default scheduling knobs ────────────────────────────────────────────

const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_SECS: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STARTUP_DELAY_SECS: u64 = 30;
const DEFAULT_UPDATE_INTERVAL_MINS: u64 = 60;
const DEFAULT_BACKFILL_INTERVAL_HOURS: i64 = 24;
const DEFAULT_MIN_HISTORY_POINTS: usize = 300;

// ── Config struct ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct WaterlineConfig {
    /// Portal origin, no trailing slash.
    pub base_url: String,
    /// JSONL usage point store used by the daemon sink.
    pub state_path: PathBuf,
    /// Width of each backward-walking daily history window.
    pub daily_chunk_days: i64,
    /// Hourly data is only served for days at least this far in the past.
    pub hourly_lag_days: i64,
    /// Depth of the monthly and daily historical backfill.
    pub history_days: i64,
    /// Depth of the hourly historical backfill.
    pub hourly_history_days: i64,
    /// Daily lookback of the periodic catch-up backfill.
    pub backfill_daily_days: i64,
    /// Hourly lookback of the periodic catch-up backfill.
    pub backfill_hourly_days: i64,
    pub daily_chunk_delay: Duration,
    pub hourly_chunk_delay: Duration,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub startup_delay: Duration,
    pub update_interval: Duration,
    pub backfill_interval_hours: i64,
    /// Daily points within the last year that count as "history already fetched".
    pub min_history_points: usize,
}

impl WaterlineConfig {
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir().context("could not resolve home directory")?;

        Ok(Self {
            base_url: env_string("WATERLINE_BASE_URL", DEFAULT_BASE_URL),
            state_path: env_path(
                "WATERLINE_STATE_PATH",
                home.join(DEFAULT_STATE_REL),
                home.as_path(),
            ),
            daily_chunk_days: env_i64("WATERLINE_DAILY_CHUNK_DAYS", DEFAULT_DAILY_CHUNK_DAYS),
            hourly_lag_days: env_i64("WATERLINE_HOURLY_LAG_DAYS", DEFAULT_HOURLY_LAG_DAYS),
            history_days: env_i64("WATERLINE_HISTORY_DAYS", DEFAULT_HISTORY_DAYS),
            hourly_history_days: env_i64(
                "WATERLINE_HOURLY_HISTORY_DAYS",
                DEFAULT_HOURLY_HISTORY_DAYS,
            ),
            backfill_daily_days: env_i64(
                "WATERLINE_BACKFILL_DAILY_DAYS",
                DEFAULT_BACKFILL_DAILY_DAYS,
            ),
            backfill_hourly_days: env_i64(
                "WATERLINE_BACKFILL_HOURLY_DAYS",
                DEFAULT_BACKFILL_HOURLY_DAYS,
            ),
            daily_chunk_delay: Duration::from_millis(env_u64(
                "WATERLINE_DAILY_CHUNK_DELAY_MS",
                DEFAULT_DAILY_CHUNK_DELAY_MS,
            )),
            hourly_chunk_delay: Duration::from_millis(env_u64(
                "WATERLINE_HOURLY_CHUNK_DELAY_MS",
                DEFAULT_HOURLY_CHUNK_DELAY_MS,
            )),
            retry: RetryPolicy {
                max_attempts: env_u32("WATERLINE_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                base_delay: Duration::from_secs(env_u64(
                    "WATERLINE_RETRY_BASE_SECS",
                    DEFAULT_RETRY_BASE_SECS,
                )),
            },
            request_timeout: Duration::from_secs(env_u64(
                "WATERLINE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            startup_delay: Duration::from_secs(env_u64(
                "WATERLINE_STARTUP_DELAY_SECS",
                DEFAULT_STARTUP_DELAY_SECS,
            )),
            update_interval: Duration::from_secs(
                env_u64("WATERLINE_UPDATE_INTERVAL_MINS", DEFAULT_UPDATE_INTERVAL_MINS) * 60,
            ),
            backfill_interval_hours: env_i64(
                "WATERLINE_BACKFILL_INTERVAL_HOURS",
                DEFAULT_BACKFILL_INTERVAL_HOURS,
            ),
            min_history_points: env_usize(
                "WATERLINE_MIN_HISTORY_POINTS",
                DEFAULT_MIN_HISTORY_POINTS,
            ),
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => val.trim().trim_end_matches('/').to_string(),
        _ => default.to_string(),
    }
}

fn env_path(key: &str, default: PathBuf, home: &std::path::Path) -> PathBuf {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => expand_tilde(&val, home),
        _ => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(val) => val.parse::<i64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn expand_tilde(input: &str, home: &std::path::Path) -> PathBuf {
    if let Some(rest) = input.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_empirical_portal_limits() {
        let config = WaterlineConfig::from_env().expect("config");
        assert_eq!(config.daily_chunk_days, 7);
        assert_eq!(config.hourly_lag_days, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.backfill_interval_hours, 24);
        assert_eq!(config.min_history_points, 300);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn tilde_paths_expand_against_home() {
        let home = std::path::Path::new("/home/tester");
        assert_eq!(
            expand_tilde("~/data/points.jsonl", home),
            PathBuf::from("/home/tester/data/points.jsonl")
        );
        assert_eq!(
            expand_tilde("/abs/points.jsonl", home),
            PathBuf::from("/abs/points.jsonl")
        );
    }
}
