use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// In-memory fingerprint cache with a sliding time window.
///
/// Entries older than the window are lazily evicted on lookup. The engine
/// additionally consults the signal log for durability across restarts.
#[derive(Debug)]
pub struct DuplicateDetector {
    window: Duration,
    first_seen: DashMap<String, DateTime<Utc>>,
    checked: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub signals_checked: u64,
    pub duplicates_found: u64,
    pub cache_size: usize,
    pub window_seconds: i64,
}

impl DuplicateDetector {
    pub fn new(window_seconds: i64) -> Self {
        Self {
            window: Duration::seconds(window_seconds),
            first_seen: DashMap::new(),
            checked: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Record the fingerprint and report whether it was already seen inside
    /// the window.
    pub fn is_duplicate(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        self.checked.fetch_add(1, Ordering::Relaxed);
        self.evict_expired(now);

        if self.first_seen.contains_key(fingerprint) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.first_seen.insert(fingerprint.to_string(), now);
        false
    }

    fn evict_expired(&self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        self.first_seen.retain(|_, seen| *seen > cutoff);
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            signals_checked: self.checked.load(Ordering::Relaxed),
            duplicates_found: self.duplicates.load(Ordering::Relaxed),
            cache_size: self.first_seen.len(),
            window_seconds: self.window.num_seconds(),
        }
    }
}
