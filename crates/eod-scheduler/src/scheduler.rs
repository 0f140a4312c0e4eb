use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use signal_core::Instrument;

/// Market wall-clock timezone (IST, no DST).
pub fn market_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("static offset")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EodPhase {
    ConditionCheck,
    Execution,
    Tracking,
}

impl EodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EodPhase::ConditionCheck => "condition_check",
            EodPhase::Execution => "execution",
            EodPhase::Tracking => "tracking",
        }
    }
}

/// The engine-side handlers the scheduler fires into.
#[async_trait]
pub trait EodCallbacks: Send + Sync {
    async fn condition_check(&self, instrument: Instrument) -> serde_json::Value;
    async fn execute(&self, instrument: Instrument) -> serde_json::Value;
    async fn track(&self, instrument: Instrument) -> serde_json::Value;
}

#[derive(Debug, Clone, Serialize)]
pub struct EodJobResult {
    pub phase: EodPhase,
    pub instrument: Instrument,
    pub fired_at: DateTime<Utc>,
    pub misfired: bool,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct EodScheduleConfig {
    pub instruments: Vec<Instrument>,
    /// Seconds before close per phase.
    pub condition_check_offset: u32,
    pub execution_offset: u32,
    pub tracking_offset: u32,
    /// Seasonal close-time overrides; instruments not listed use their
    /// contract defaults.
    pub close_overrides: HashMap<Instrument, NaiveTime>,
    /// Late-fire tolerance; beyond it the job is skipped as a misfire.
    pub misfire_grace: Duration,
    /// Worker pool cap across all jobs.
    pub max_workers: usize,
}

impl Default for EodScheduleConfig {
    fn default() -> Self {
        Self {
            instruments: vec![Instrument::BankNifty, Instrument::GoldMini],
            condition_check_offset: 45,
            execution_offset: 30,
            tracking_offset: 15,
            close_overrides: HashMap::new(),
            misfire_grace: Duration::from_secs(10),
            max_workers: 4,
        }
    }
}

/// Next UTC instant at which a daily job `offset_secs` before `close`
/// (market wall clock) fires, strictly after `now`.
pub fn next_fire_instant(now: DateTime<Utc>, close: NaiveTime, offset_secs: u32) -> DateTime<Utc> {
    let tz = market_offset();
    let local_now = now.with_timezone(&tz);
    let fire_time = close - chrono::Duration::seconds(offset_secs as i64);

    let mut date = local_now.date_naive();
    loop {
        if let Some(candidate) = date
            .and_time(fire_time)
            .and_local_timezone(tz)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
        {
            if candidate > now {
                return candidate;
            }
        }
        date += chrono::Duration::days(1);
    }
}

/// Wall-clock scheduler firing the three pre-close phases per instrument.
///
/// One task per (instrument, phase) computes its next daily fire instant
/// and sleeps until it; a shared semaphore bounds concurrent jobs. Jobs do
/// not coalesce; a job that wakes past the grace window is recorded as a
/// misfire and skipped.
pub struct EodScheduler {
    config: EodScheduleConfig,
    callbacks: Arc<dyn EodCallbacks>,
    workers: Arc<Semaphore>,
    history: Arc<Mutex<Vec<EodJobResult>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

const MAX_HISTORY: usize = 100;

impl EodScheduler {
    pub fn new(config: EodScheduleConfig, callbacks: Arc<dyn EodCallbacks>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(config.max_workers));
        Self {
            config,
            callbacks,
            workers,
            history: Arc::new(Mutex::new(Vec::new())),
            stop_tx,
            stop_rx,
        }
    }

    pub fn history(&self) -> Vec<EodJobResult> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for &instrument in &self.config.instruments {
            for (phase, offset) in [
                (EodPhase::ConditionCheck, self.config.condition_check_offset),
                (EodPhase::Execution, self.config.execution_offset),
                (EodPhase::Tracking, self.config.tracking_offset),
            ] {
                handles.push(self.spawn_job(instrument, phase, offset));
            }
        }
        tracing::info!(
            instruments = self.config.instruments.len(),
            "EOD scheduler started"
        );
        handles
    }

    fn spawn_job(&self, instrument: Instrument, phase: EodPhase, offset: u32) -> JoinHandle<()> {
        let callbacks = self.callbacks.clone();
        let workers = self.workers.clone();
        let history = self.history.clone();
        let misfire_grace = self.config.misfire_grace;
        let mut stop_rx = self.stop_rx.clone();
        let close = self
            .config
            .close_overrides
            .get(&instrument)
            .copied()
            .unwrap_or_else(|| instrument.config().market_close());

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let fire_at = next_fire_instant(now, close, offset);
                let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!(
                    instrument = instrument.as_str(),
                    phase = phase.as_str(),
                    fire_at = %fire_at,
                    "EOD job scheduled"
                );

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return;
                        }
                        continue;
                    }
                }

                // One instance per job: this task runs phases serially.
                let Ok(_permit) = workers.acquire().await else { return };
                let fired_at = Utc::now();
                let lateness = (fired_at - fire_at).to_std().unwrap_or(Duration::ZERO);

                let result = if lateness > misfire_grace {
                    tracing::warn!(
                        instrument = instrument.as_str(),
                        phase = phase.as_str(),
                        lateness_secs = lateness.as_secs_f64(),
                        "EOD job misfired, skipping"
                    );
                    EodJobResult { phase, instrument, fired_at, misfired: true, result: None }
                } else {
                    tracing::info!(
                        instrument = instrument.as_str(),
                        phase = phase.as_str(),
                        "running EOD job"
                    );
                    let value = match phase {
                        EodPhase::ConditionCheck => callbacks.condition_check(instrument).await,
                        EodPhase::Execution => callbacks.execute(instrument).await,
                        EodPhase::Tracking => callbacks.track(instrument).await,
                    };
                    EodJobResult { phase, instrument, fired_at, misfired: false, result: Some(value) }
                };

                let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
                history.push(result);
                let len = history.len();
                if len > MAX_HISTORY {
                    history.drain(..len - MAX_HISTORY);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn fire_instant_is_offset_before_close_in_market_time() {
        let close = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        // 05:00 UTC = 10:30 IST, well before close.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        let fire = next_fire_instant(now, close, 45);

        let local = fire.with_timezone(&market_offset());
        assert_eq!(local.date_naive(), now.with_timezone(&market_offset()).date_naive());
        assert_eq!((local.hour(), local.minute(), local.second()), (15, 29, 15));
    }

    #[test]
    fn fire_instant_rolls_to_next_day_after_close() {
        let close = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        // 12:00 UTC = 17:30 IST, past close: tomorrow.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        let fire = next_fire_instant(now, close, 30);

        let local = fire.with_timezone(&market_offset());
        assert_eq!(local.date_naive(), chrono::NaiveDate::from_ymd_opt(2025, 6, 3).unwrap());
        assert_eq!((local.hour(), local.minute(), local.second()), (15, 29, 30));
    }

    #[test]
    fn offsets_order_check_before_exec_before_track() {
        let close = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        let check = next_fire_instant(now, close, 45);
        let exec = next_fire_instant(now, close, 30);
        let track = next_fire_instant(now, close, 15);
        assert!(check < exec && exec < track);
        assert_eq!((exec - check).num_seconds(), 15);
        assert_eq!((track - exec).num_seconds(), 15);
    }
}
