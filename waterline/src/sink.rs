//! Statistics sink interface.
//!
//! The real time-series store lives outside this crate; the core only needs
//! an idempotent append plus a query used by the billing detector and the
//! already-have-history check. `JsonlSink` is the daemon's concrete store
//! (append-only JSONL with a seen-key set loaded at open, so re-inserting
//! known points across restarts stays a no-op), and `MemorySink` is the
//! reference implementation used by tests.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{Resolution, UsagePoint};

pub trait StatisticsSink: Send + Sync {
    /// Insert points into a series, idempotent per (series, timestamp).
    /// Returns how many points were actually new.
    fn insert_points(&self, series_id: &str, points: &[UsagePoint]) -> Result<usize>;

    /// All points of a series at the given resolution with
    /// `timestamp >= since`, ordered by timestamp.
    fn query_points(
        &self,
        series_id: &str,
        since: NaiveDateTime,
        resolution: Resolution,
    ) -> Result<Vec<UsagePoint>>;
}

// ── In-memory sink ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySink {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    series: HashMap<String, BTreeMap<NaiveDateTime, UsagePoint>>,
    insert_log: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series_len(&self, series_id: &str) -> usize {
        let inner = self.lock();
        inner.series.get(series_id).map_or(0, BTreeMap::len)
    }

    pub fn points(&self, series_id: &str) -> Vec<UsagePoint> {
        let inner = self.lock();
        inner
            .series
            .get(series_id)
            .map(|points| points.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Series id of every non-empty insert call, in call order.
    pub fn insert_log(&self) -> Vec<String> {
        self.lock().insert_log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StatisticsSink for MemorySink {
    fn insert_points(&self, series_id: &str, points: &[UsagePoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let mut inner = self.lock();
        inner.insert_log.push(series_id.to_string());
        let series = inner.series.entry(series_id.to_string()).or_default();
        let mut inserted = 0;
        for point in points {
            if series.insert(point.timestamp, point.clone()).is_none() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn query_points(
        &self,
        series_id: &str,
        since: NaiveDateTime,
        resolution: Resolution,
    ) -> Result<Vec<UsagePoint>> {
        let inner = self.lock();
        Ok(inner
            .series
            .get(series_id)
            .map(|points| {
                points
                    .range(since..)
                    .map(|(_, point)| point.clone())
                    .filter(|point| point.resolution == resolution)
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ── JSONL-backed sink ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct PointRecord {
    series: String,
    timestamp: NaiveDateTime,
    usage: f64,
    resolution: Resolution,
}

pub struct JsonlSink {
    path: PathBuf,
    seen: Mutex<HashSet<(String, i64)>>,
}

impl JsonlSink {
    /// Open (or create) the point store and load its dedup keys.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create sink directory {}", dir.display()))?;
        }

        let mut seen = HashSet::new();
        if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("open point store at {}", path.display()))?;
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { continue };
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(record) = serde_json::from_str::<PointRecord>(&line) {
                    seen.insert(point_key(&record.series, record.timestamp));
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            seen: Mutex::new(seen),
        })
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashSet<(String, i64)>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StatisticsSink for JsonlSink {
    fn insert_points(&self, series_id: &str, points: &[UsagePoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut seen = self.seen();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open point store for append at {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut inserted = 0;
        for point in points {
            let key = point_key(series_id, point.timestamp);
            if !seen.insert(key) {
                continue;
            }
            let record = PointRecord {
                series: series_id.to_string(),
                timestamp: point.timestamp,
                usage: point.usage,
                resolution: point.resolution,
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            writer.write_all(&line)?;
            inserted += 1;
        }

        writer.flush().context("flush point store")?;
        Ok(inserted)
    }

    fn query_points(
        &self,
        series_id: &str,
        since: NaiveDateTime,
        resolution: Resolution,
    ) -> Result<Vec<UsagePoint>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("open point store at {}", self.path.display()))?;

        let mut points = Vec::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { continue };
            let Ok(record) = serde_json::from_str::<PointRecord>(&line) else {
                continue;
            };
            if record.series != series_id
                || record.resolution != resolution
                || record.timestamp < since
            {
                continue;
            }
            points.push(UsagePoint {
                timestamp: record.timestamp,
                usage: record.usage,
                resolution: record.resolution,
            });
        }

        points.sort_by_key(|point| point.timestamp);
        Ok(points)
    }
}

fn point_key(series_id: &str, timestamp: NaiveDateTime) -> (String, i64) {
    (series_id.to_string(), timestamp.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn point(day: u32, usage: f64) -> UsagePoint {
        UsagePoint {
            timestamp: NaiveDate::from_ymd_opt(2023, 10, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            usage,
            resolution: Resolution::Daily,
        }
    }

    fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn memory_sink_is_idempotent_per_timestamp() {
        let sink = MemorySink::new();
        assert_eq!(
            sink.insert_points("s", &[point(1, 10.0), point(2, 11.0)]).unwrap(),
            2
        );
        assert_eq!(sink.insert_points("s", &[point(1, 10.0)]).unwrap(), 0);
        assert_eq!(sink.series_len("s"), 2);
    }

    #[test]
    fn memory_sink_query_filters_resolution_and_since() {
        let sink = MemorySink::new();
        sink.insert_points("s", &[point(1, 10.0), point(5, 11.0)]).unwrap();
        let since = NaiveDate::from_ymd_opt(2023, 10, 3)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let found = sink.query_points("s", since, Resolution::Daily).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].usage, 11.0);
        assert!(sink.query_points("s", epoch(), Resolution::Hourly).unwrap().is_empty());
    }

    #[test]
    fn jsonl_sink_round_trips_points() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("points.jsonl");
        let sink = JsonlSink::open(&path).expect("open");

        assert_eq!(sink.insert_points("s", &[point(1, 10.0), point(2, 11.0)]).unwrap(), 2);
        let found = sink.query_points("s", epoch(), Resolution::Daily).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].usage, 10.0);
    }

    #[test]
    fn jsonl_sink_dedups_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("points.jsonl");

        let sink = JsonlSink::open(&path).expect("open");
        assert_eq!(sink.insert_points("s", &[point(1, 10.0)]).unwrap(), 1);
        drop(sink);

        let sink = JsonlSink::open(&path).expect("reopen");
        assert_eq!(sink.insert_points("s", &[point(1, 10.0), point(2, 11.0)]).unwrap(), 1);
        assert_eq!(
            sink.query_points("s", epoch(), Resolution::Daily).unwrap().len(),
            2
        );
    }

    #[test]
    fn jsonl_sink_tolerates_malformed_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("points.jsonl");
        fs::write(&path, "{broken\nnot json\n").expect("seed");

        let sink = JsonlSink::open(&path).expect("open");
        assert_eq!(sink.insert_points("s", &[point(1, 10.0)]).unwrap(), 1);
        assert_eq!(
            sink.query_points("s", epoch(), Resolution::Daily).unwrap().len(),
            1
        );
    }
}
