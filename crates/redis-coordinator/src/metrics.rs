//! Coordinator health metrics.
//!
//! A fixed-size rolling window (last 100 samples, FIFO) backs the latency
//! percentiles; percentile values are computed by index interpolation over
//! the sorted window.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const LATENCY_WINDOW: usize = 100;

pub const DB_SYNC_FAILURE_RATE_WARNING: f64 = 0.05;
pub const DB_SYNC_FAILURE_RATE_CRITICAL: f64 = 0.10;
pub const LEADERSHIP_CHANGES_WARNING_PER_HOUR: usize = 3;
pub const LEADERSHIP_CHANGES_CRITICAL_PER_HOUR: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Ok,
    Warning,
    Critical,
}

impl AlertStatus {
    fn worst(self, other: AlertStatus) -> AlertStatus {
        use AlertStatus::*;
        match (self, other) {
            (Critical, _) | (_, Critical) => Critical,
            (Warning, _) | (_, Warning) => Warning,
            _ => Ok,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertCheck {
    pub status: AlertStatus,
    pub value: Option<f64>,
    pub threshold_warning: f64,
    pub threshold_critical: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alerts {
    pub db_sync_failure_rate: AlertCheck,
    pub leadership_changes: AlertCheck,
    pub heartbeat_staleness: AlertCheck,
    pub overall_status: AlertStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub db_sync_success: u64,
    pub db_sync_failure: u64,
    pub db_sync_total: u64,
    pub db_sync_failure_rate: f64,
    pub db_sync_latency_samples: usize,
    pub db_sync_avg_latency_ms: f64,
    pub db_sync_min_latency_ms: f64,
    pub db_sync_max_latency_ms: f64,
    pub db_sync_p50_latency_ms: f64,
    pub db_sync_p95_latency_ms: f64,
    pub db_sync_p99_latency_ms: f64,
    pub leadership_changes: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    db_sync_success: u64,
    db_sync_failure: u64,
    latency_ms: VecDeque<f64>,
    leadership_changes: u64,
    change_times: VecDeque<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Thread-safe metrics accumulator shared between the heartbeat task and
/// the stats endpoint.
#[derive(Debug)]
pub struct CoordinatorMetrics {
    inner: Mutex<Inner>,
    stale_warning_secs: f64,
    stale_critical_secs: f64,
}

impl CoordinatorMetrics {
    pub fn new(stale_warning_secs: f64, stale_critical_secs: f64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stale_warning_secs,
            stale_critical_secs,
        }
    }

    pub fn record_db_sync(&self, success: bool, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if success {
            inner.db_sync_success += 1;
        } else {
            inner.db_sync_failure += 1;
        }
        // Latency recorded even for failures so slow paths stay visible.
        if inner.latency_ms.len() == LATENCY_WINDOW {
            inner.latency_ms.pop_front();
        }
        inner.latency_ms.push_back(latency_ms);
    }

    pub fn record_leadership_change(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.leadership_changes += 1;
        if inner.change_times.len() == LATENCY_WINDOW {
            inner.change_times.pop_front();
        }
        inner.change_times.push_back(now);
    }

    pub fn update_heartbeat_time(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_heartbeat = Some(now);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = inner.db_sync_success + inner.db_sync_failure;
        let mut sorted: Vec<f64> = inner.latency_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let (avg, min, max, p50, p95, p99) = if sorted.is_empty() {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        } else {
            let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
            (
                avg,
                sorted[0],
                sorted[sorted.len() - 1],
                percentile(&sorted, 50.0),
                percentile(&sorted, 95.0),
                percentile(&sorted, 99.0),
            )
        };

        MetricsSnapshot {
            db_sync_success: inner.db_sync_success,
            db_sync_failure: inner.db_sync_failure,
            db_sync_total: total,
            db_sync_failure_rate: inner.db_sync_failure as f64 / total.max(1) as f64,
            db_sync_latency_samples: sorted.len(),
            db_sync_avg_latency_ms: avg,
            db_sync_min_latency_ms: min,
            db_sync_max_latency_ms: max,
            db_sync_p50_latency_ms: p50,
            db_sync_p95_latency_ms: p95,
            db_sync_p99_latency_ms: p99,
            leadership_changes: inner.leadership_changes,
            last_heartbeat: inner.last_heartbeat,
        }
    }

    pub fn check_alerts(&self, now: DateTime<Utc>) -> Alerts {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let total = inner.db_sync_success + inner.db_sync_failure;
        let failure_rate = inner.db_sync_failure as f64 / total.max(1) as f64;
        let sync_status = if failure_rate >= DB_SYNC_FAILURE_RATE_CRITICAL {
            AlertStatus::Critical
        } else if failure_rate >= DB_SYNC_FAILURE_RATE_WARNING {
            AlertStatus::Warning
        } else {
            AlertStatus::Ok
        };
        let db_sync_failure_rate = AlertCheck {
            status: sync_status,
            value: Some(failure_rate),
            threshold_warning: DB_SYNC_FAILURE_RATE_WARNING,
            threshold_critical: DB_SYNC_FAILURE_RATE_CRITICAL,
            message: format!("DB sync failure rate is {:.1}%", failure_rate * 100.0),
        };

        let hour_ago = now - Duration::hours(1);
        let changes_per_hour = inner.change_times.iter().filter(|t| **t >= hour_ago).count();
        let change_status = if changes_per_hour >= LEADERSHIP_CHANGES_CRITICAL_PER_HOUR {
            AlertStatus::Critical
        } else if changes_per_hour >= LEADERSHIP_CHANGES_WARNING_PER_HOUR {
            AlertStatus::Warning
        } else {
            AlertStatus::Ok
        };
        let leadership_changes = AlertCheck {
            status: change_status,
            value: Some(changes_per_hour as f64),
            threshold_warning: LEADERSHIP_CHANGES_WARNING_PER_HOUR as f64,
            threshold_critical: LEADERSHIP_CHANGES_CRITICAL_PER_HOUR as f64,
            message: format!("Leadership changed {changes_per_hour} times in the last hour"),
        };

        let (hb_status, hb_value, hb_message) = match inner.last_heartbeat {
            None => (
                AlertStatus::Critical,
                None,
                "No heartbeat recorded".to_string(),
            ),
            Some(last) => {
                let stale = (now - last).num_milliseconds() as f64 / 1000.0;
                let status = if stale >= self.stale_critical_secs {
                    AlertStatus::Critical
                } else if stale >= self.stale_warning_secs {
                    AlertStatus::Warning
                } else {
                    AlertStatus::Ok
                };
                (status, Some(stale), format!("Last heartbeat {stale:.1}s ago"))
            }
        };
        let heartbeat_staleness = AlertCheck {
            status: hb_status,
            value: hb_value,
            threshold_warning: self.stale_warning_secs,
            threshold_critical: self.stale_critical_secs,
            message: hb_message,
        };

        let overall_status = db_sync_failure_rate
            .status
            .worst(leadership_changes.status)
            .worst(heartbeat_staleness.status);

        Alerts {
            db_sync_failure_rate,
            leadership_changes,
            heartbeat_staleness,
            overall_status,
        }
    }
}

/// Index-interpolated percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let index = (pct / 100.0) * (n - 1) as f64;
            let floor = index.floor() as usize;
            let ceil = (floor + 1).min(n - 1);
            if floor == ceil {
                sorted[floor]
            } else {
                let weight = index - floor as f64;
                sorted[floor] * (1.0 - weight) + sorted[ceil] * weight
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> CoordinatorMetrics {
        CoordinatorMetrics::new(30.0, 60.0)
    }

    #[test]
    fn percentile_interpolates() {
        let samples = vec![10.0, 20.0, 30.0, 40.0];
        // index = 0.95 * 3 = 2.85 -> 30 + 0.85 * 10
        assert!((percentile(&samples, 95.0) - 38.5).abs() < 1e-9);
        assert_eq!(percentile(&samples, 50.0), 25.0);
        assert_eq!(percentile(&[42.0], 99.0), 42.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
    }

    #[test]
    fn window_caps_at_100_samples() {
        let m = metrics();
        for i in 0..150 {
            m.record_db_sync(true, i as f64);
        }
        let snap = m.snapshot();
        assert_eq!(snap.db_sync_latency_samples, 100);
        // Oldest 50 evicted.
        assert_eq!(snap.db_sync_min_latency_ms, 50.0);
        assert_eq!(snap.db_sync_max_latency_ms, 149.0);
    }

    #[test]
    fn failure_rate_alerts_trip_at_thresholds() {
        let m = metrics();
        for _ in 0..95 {
            m.record_db_sync(true, 1.0);
        }
        for _ in 0..5 {
            m.record_db_sync(false, 1.0);
        }
        let now = Utc::now();
        m.update_heartbeat_time(now);
        let alerts = m.check_alerts(now);
        assert_eq!(alerts.db_sync_failure_rate.status, AlertStatus::Warning);

        for _ in 0..6 {
            m.record_db_sync(false, 1.0);
        }
        let alerts = m.check_alerts(now);
        assert_eq!(alerts.db_sync_failure_rate.status, AlertStatus::Critical);
    }

    #[test]
    fn leadership_flapping_alert() {
        let m = metrics();
        let now = Utc::now();
        m.update_heartbeat_time(now);
        for _ in 0..3 {
            m.record_leadership_change(now);
        }
        assert_eq!(m.check_alerts(now).leadership_changes.status, AlertStatus::Warning);
        for _ in 0..7 {
            m.record_leadership_change(now);
        }
        assert_eq!(m.check_alerts(now).leadership_changes.status, AlertStatus::Critical);
        // Changes older than an hour fall out of the window.
        let later = now + Duration::hours(2);
        m.update_heartbeat_time(later);
        assert_eq!(m.check_alerts(later).leadership_changes.status, AlertStatus::Ok);
    }

    #[test]
    fn heartbeat_staleness_alert() {
        let m = metrics();
        let now = Utc::now();
        assert_eq!(m.check_alerts(now).heartbeat_staleness.status, AlertStatus::Critical);

        m.update_heartbeat_time(now);
        assert_eq!(m.check_alerts(now).heartbeat_staleness.status, AlertStatus::Ok);
        assert_eq!(
            m.check_alerts(now + Duration::seconds(31)).heartbeat_staleness.status,
            AlertStatus::Warning
        );
        assert_eq!(
            m.check_alerts(now + Duration::seconds(61)).heartbeat_staleness.status,
            AlertStatus::Critical
        );
        assert_eq!(m.check_alerts(now + Duration::seconds(61)).overall_status, AlertStatus::Critical);
    }
}
