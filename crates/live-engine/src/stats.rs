use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::json;

/// Engine execution counters, exported on `/webhook/stats`.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub signals_received: AtomicU64,
    pub entries_executed: AtomicU64,
    pub entries_blocked: AtomicU64,
    pub pyramids_executed: AtomicU64,
    pub pyramids_blocked: AtomicU64,
    pub exits_executed: AtomicU64,
    pub orders_failed: AtomicU64,
    pub eod_executions: AtomicU64,
    pub pm_stop_exits: AtomicU64,
    last_signal_at: Mutex<Option<DateTime<Utc>>>,
}

impl EngineStats {
    pub fn record_signal(&self, now: DateTime<Utc>) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
        *self.last_signal_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let last = *self.last_signal_at.lock().unwrap_or_else(|e| e.into_inner());
        json!({
            "signals_received": self.signals_received.load(Ordering::Relaxed),
            "entries_executed": self.entries_executed.load(Ordering::Relaxed),
            "entries_blocked": self.entries_blocked.load(Ordering::Relaxed),
            "pyramids_executed": self.pyramids_executed.load(Ordering::Relaxed),
            "pyramids_blocked": self.pyramids_blocked.load(Ordering::Relaxed),
            "exits_executed": self.exits_executed.load(Ordering::Relaxed),
            "orders_failed": self.orders_failed.load(Ordering::Relaxed),
            "eod_executions": self.eod_executions.load(Ordering::Relaxed),
            "pm_stop_exits": self.pm_stop_exits.load(Ordering::Relaxed),
            "last_signal_at": last.map(|t| t.to_rfc3339()),
        })
    }
}
