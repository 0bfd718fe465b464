use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("cannot serialize summary")]
    Json(#[from] serde_json::Error),

    #[error("cannot write summary to {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a single request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Response(StatusCode),
    /// Headers arrived but the body could not be read.
    BodyError(StatusCode),
    TransportError,
}

/// Counters and samples shared by every VU of a run.
#[derive(Debug)]
pub struct Metrics {
    iterations: AtomicU64,
    iterations_interrupted: AtomicU64,
    http_reqs: AtomicU64,
    http_req_failed: AtomicU64,
    vus: AtomicUsize,
    vus_min: AtomicUsize,
    vus_peak: AtomicUsize,
    vus_max: AtomicUsize,
    req_durations: Mutex<Vec<Duration>>,
    iter_durations: Mutex<Vec<Duration>>,
    status_codes: Mutex<BTreeMap<u16, u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            iterations: AtomicU64::new(0),
            iterations_interrupted: AtomicU64::new(0),
            http_reqs: AtomicU64::new(0),
            http_req_failed: AtomicU64::new(0),
            vus: AtomicUsize::new(0),
            // nothing observed yet
            vus_min: AtomicUsize::new(usize::MAX),
            vus_peak: AtomicUsize::new(0),
            vus_max: AtomicUsize::new(0),
            req_durations: Mutex::default(),
            iter_durations: Mutex::default(),
            status_codes: Mutex::default(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, elapsed: Duration, outcome: RequestOutcome) {
        self.http_reqs.fetch_add(1, Ordering::Relaxed);

        let failed = match outcome {
            RequestOutcome::Response(status) => {
                self.count_status(status);
                !(status.is_success() || status.is_redirection())
            }
            RequestOutcome::BodyError(status) => {
                self.count_status(status);
                true
            }
            RequestOutcome::TransportError => true,
        };
        if failed {
            self.http_req_failed.fetch_add(1, Ordering::Relaxed);
        }

        lock(&self.req_durations).push(elapsed);
    }

    fn count_status(&self, status: StatusCode) {
        *lock(&self.status_codes).entry(status.as_u16()).or_default() += 1;
    }

    pub fn record_iteration(&self, elapsed: Duration) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        lock(&self.iter_durations).push(elapsed);
    }

    pub fn record_interrupted(&self) {
        self.iterations_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes the active VU level and tracks its range over the run.
    pub fn set_vus(&self, vus: usize) {
        self.vus.store(vus, Ordering::Relaxed);
        self.vus_min.fetch_min(vus, Ordering::Relaxed);
        self.vus_peak.fetch_max(vus, Ordering::Relaxed);
    }

    /// Drops the level to zero at the end of a run without touching its range.
    pub fn clear_vus(&self) {
        self.vus.store(0, Ordering::Relaxed);
    }

    pub fn set_vus_max(&self, vus: usize) {
        self.vus_max.store(vus, Ordering::Relaxed);
    }

    pub fn vus(&self) -> usize {
        self.vus.load(Ordering::Relaxed)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn http_reqs(&self) -> u64 {
        self.http_reqs.load(Ordering::Relaxed)
    }

    pub fn summary(
        &self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Summary {
        let secs = elapsed.as_secs_f64();
        let rate = |count: u64| if secs > 0.0 { count as f64 / secs } else { 0.0 };

        let iterations = self.iterations();
        let http_reqs = self.http_reqs();
        let http_req_failed = self.http_req_failed.load(Ordering::Relaxed);
        let vus_peak = self.vus_peak.load(Ordering::Relaxed);
        let vus_min = self.vus_min.load(Ordering::Relaxed).min(vus_peak);

        Summary {
            started_at,
            finished_at,
            elapsed_secs: secs,
            vus: self.vus(),
            vus_min,
            vus_peak,
            vus_max: self.vus_max.load(Ordering::Relaxed),
            iterations,
            iterations_rate: rate(iterations),
            iterations_interrupted: self.iterations_interrupted.load(Ordering::Relaxed),
            http_reqs,
            http_reqs_rate: rate(http_reqs),
            http_req_failed,
            http_req_failed_ratio: if http_reqs > 0 {
                http_req_failed as f64 / http_reqs as f64
            } else {
                0.0
            },
            status_codes: lock(&self.status_codes).clone(),
            http_req_duration: Trend::from_samples(&lock(&self.req_durations)),
            iteration_duration: Trend::from_samples(&lock(&self.iter_durations)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Duration statistics in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
}

impl Trend {
    pub fn from_samples(samples: &[Duration]) -> Option<Trend> {
        if samples.is_empty() {
            return None;
        }

        let mut ms: Vec<f64> = samples
            .iter()
            .map(|d| d.as_nanos() as f64 / 1e6)
            .collect();
        ms.sort_by(f64::total_cmp);

        Some(Trend {
            avg: ms.iter().sum::<f64>() / ms.len() as f64,
            min: ms[0],
            med: percentile(&ms, 0.5),
            max: ms[ms.len() - 1],
            p90: percentile(&ms, 0.9),
            p95: percentile(&ms, 0.95),
        })
    }
}

// Linear interpolation between closest ranks; `sorted` is non-empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    /// Active VUs when the summary was taken.
    pub vus: usize,
    pub vus_min: usize,
    pub vus_peak: usize,
    pub vus_max: usize,
    pub iterations: u64,
    pub iterations_rate: f64,
    pub iterations_interrupted: u64,
    pub http_reqs: u64,
    pub http_reqs_rate: f64,
    pub http_req_failed: u64,
    pub http_req_failed_ratio: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub http_req_duration: Option<Trend>,
    pub iteration_duration: Option<Trend>,
}

impl Summary {
    pub fn export(&self, path: &Path) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

struct TrendLine<'a>(&'a Option<Trend>);

impl fmt::Display for TrendLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t) => write!(
                f,
                "avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms",
                t.avg, t.min, t.med, t.max, t.p90, t.p95
            ),
            None => write!(f, "no samples"),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} -> {} ({:.1}s)",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.finished_at.format("%Y-%m-%d %H:%M:%S"),
            self.elapsed_secs
        )?;
        writeln!(
            f,
            "     http_req_duration......: {}",
            TrendLine(&self.http_req_duration)
        )?;
        writeln!(
            f,
            "     http_req_failed........: {:.2}% ({} of {})",
            self.http_req_failed_ratio * 100.0,
            self.http_req_failed,
            self.http_reqs
        )?;
        writeln!(
            f,
            "     http_reqs..............: {} {:.2}/s",
            self.http_reqs, self.http_reqs_rate
        )?;
        for (code, count) in &self.status_codes {
            writeln!(f, "       status {code}...........: {count}")?;
        }
        writeln!(
            f,
            "     iteration_duration.....: {}",
            TrendLine(&self.iteration_duration)
        )?;
        writeln!(
            f,
            "     iterations.............: {} {:.2}/s",
            self.iterations, self.iterations_rate
        )?;
        writeln!(f, "     iterations_interrupted.: {}", self.iterations_interrupted)?;
        writeln!(
            f,
            "     vus....................: {} min={} max={}",
            self.vus, self.vus_min, self.vus_peak
        )?;
        write!(f, "     vus_max................: {}", self.vus_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn trend_over_one_to_hundred_ms() {
        let samples: Vec<Duration> = (1..=100).rev().map(Duration::from_millis).collect();
        let trend = Trend::from_samples(&samples).unwrap();

        assert!(close(trend.avg, 50.5));
        assert!(close(trend.min, 1.0));
        assert!(close(trend.max, 100.0));
        assert!(close(trend.med, 50.5));
        assert!(close(trend.p90, 90.1));
        assert!(close(trend.p95, 95.05));
    }

    #[test]
    fn single_sample_trend() {
        let trend = Trend::from_samples(&[Duration::from_millis(7)]).unwrap();
        assert!(close(trend.med, 7.0));
        assert!(close(trend.p95, 7.0));
        assert!(Trend::from_samples(&[]).is_none());
    }

    #[test]
    fn failures_follow_status_class() {
        let metrics = Metrics::new();
        let ms = Duration::from_millis(5);
        for status in [
            StatusCode::OK,
            StatusCode::FOUND,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            metrics.record_request(ms, RequestOutcome::Response(status));
        }
        metrics.record_request(ms, RequestOutcome::TransportError);

        let now = Utc::now();
        let summary = metrics.summary(now, now, Duration::from_secs(1));
        assert_eq!(summary.http_reqs, 5);
        assert_eq!(summary.http_req_failed, 3);
        assert!(close(summary.http_req_failed_ratio, 0.6));
        assert!(close(summary.http_reqs_rate, 5.0));
        assert_eq!(summary.status_codes.get(&200), Some(&1));
        assert_eq!(summary.status_codes.get(&404), Some(&1));
        assert_eq!(summary.status_codes.len(), 4);
    }

    #[test]
    fn empty_run_summary() {
        let metrics = Metrics::new();
        metrics.set_vus_max(4);
        let now = Utc::now();
        let summary = metrics.summary(now, now, Duration::ZERO);

        assert_eq!(summary.vus_max, 4);
        assert_eq!(summary.iterations, 0);
        assert!(close(summary.iterations_rate, 0.0));
        assert!(close(summary.http_req_failed_ratio, 0.0));
        assert!(summary.http_req_duration.is_none());

        assert_eq!(summary.vus_min, 0);
        assert_eq!(summary.vus_peak, 0);

        let text = summary.to_string();
        assert!(text.contains("vus_max................: 4"));
        assert!(text.contains("no samples"));
    }

    #[test]
    fn body_error_keeps_status_and_fails() {
        let metrics = Metrics::new();
        let outcome = RequestOutcome::BodyError(StatusCode::OK);
        metrics.record_request(Duration::from_millis(3), outcome);

        let now = Utc::now();
        let summary = metrics.summary(now, now, Duration::from_secs(1));
        assert_eq!(summary.http_reqs, 1);
        assert_eq!(summary.http_req_failed, 1);
        assert_eq!(summary.status_codes.get(&200), Some(&1));
    }

    #[test]
    fn vus_range_survives_clear() {
        let metrics = Metrics::new();
        for vus in [1, 2, 4, 3, 1] {
            metrics.set_vus(vus);
        }
        assert_eq!(metrics.vus(), 1);
        metrics.clear_vus();

        let now = Utc::now();
        let summary = metrics.summary(now, now, Duration::from_secs(1));
        assert_eq!(summary.vus, 0);
        assert_eq!(summary.vus_min, 1);
        assert_eq!(summary.vus_peak, 4);
        assert!(summary.to_string().contains("vus....................: 0 min=1 max=4"));
    }

    #[test]
    fn export_to_missing_directory_is_an_io_error() {
        let metrics = Metrics::new();
        let now = Utc::now();
        let summary = metrics.summary(now, now, Duration::from_secs(1));

        let err = summary.export(Path::new("/nonexistent/vuramp/summary.json"));
        assert!(matches!(err, Err(ExportError::Io { .. })));
    }

    #[test]
    fn summary_serializes_to_json() {
        let metrics = Metrics::new();
        metrics.record_iteration(Duration::from_millis(10));
        let ok = RequestOutcome::Response(StatusCode::OK);
        metrics.record_request(Duration::from_millis(8), ok);
        let now = Utc::now();
        let summary = metrics.summary(now, now, Duration::from_secs(2));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["iterations"], 1);
        assert_eq!(json["status_codes"]["200"], 1);
        assert_eq!(json["http_req_duration"]["max"], 8.0);
    }
}
