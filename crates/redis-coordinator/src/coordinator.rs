use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics::{Alerts, CoordinatorMetrics, MetricsSnapshot};

pub const LEADER_KEY: &str = "pm:leader";
pub const HEARTBEAT_PREFIX: &str = "pm:heartbeat:";
pub const SIGNAL_LOCK_PREFIX: &str = "pm:signal_lock:";

/// Atomic compare-and-extend: renew the lease only while we still hold it.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Atomic compare-and-delete: release only while we still hold the lease.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub const HEARTBEAT_TTL_SECS: u64 = 30;
pub const SIGNAL_LOCK_TTL_SECS: u64 = 30;

/// Leader row as the relational store sees it.
#[derive(Debug, Clone)]
pub struct DbLeader {
    pub instance_id: String,
    pub hostname: Option<String>,
    pub leader_acquired_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Relational-store side of coordination: the coordinator publishes its own
/// row and cross-checks the fleet's leader for split-brain detection.
#[async_trait]
pub trait LeaderStore: Send + Sync {
    async fn upsert_instance_metadata(
        &self,
        instance_id: &str,
        is_leader: bool,
        status: &str,
        hostname: &str,
    ) -> Result<()>;

    /// Current fresh leader per the relational store. `force_fresh` issues a
    /// sync-point read first so the select observes all committed writes.
    async fn get_current_leader(&self, force_fresh: bool) -> Result<Option<DbLeader>>;

    async fn record_leadership_transition(
        &self,
        instance_id: &str,
        became_leader: bool,
        hostname: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub redis_url: String,
    pub enable_redis: bool,
    pub leader_ttl: Duration,
    /// Renew at `ttl × ratio` while leader.
    pub renewal_ratio: f64,
    /// Election attempt cadence while follower.
    pub election_interval: Duration,
    /// Cross-check the relational leader every Nth heartbeat iteration.
    pub split_brain_check_every: u64,
    pub instance_id_path: PathBuf,
    pub heartbeat_stale_warning_secs: f64,
    pub heartbeat_stale_critical_secs: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            enable_redis: true,
            leader_ttl: Duration::from_secs(10),
            renewal_ratio: 0.5,
            election_interval: Duration::from_millis(2500),
            split_brain_check_every: 10,
            instance_id_path: PathBuf::from(".redis_instance_id"),
            heartbeat_stale_warning_secs: 30.0,
            heartbeat_stale_critical_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitBrain {
    pub redis_leader: Option<String>,
    pub db_leader: Option<String>,
}

struct Inner {
    instance_id: String,
    hostname: String,
    config: CoordinatorConfig,
    /// `None` in fallback mode. The manager reconnects internally; clones
    /// share the underlying connection.
    conn: Option<ConnectionManager>,
    db: Option<Arc<dyn LeaderStore>>,
    is_leader: Mutex<bool>,
    metrics: CoordinatorMetrics,
    heartbeat_iteration: AtomicU64,
}

/// Redis-backed leader election with heartbeat renewal and split-brain
/// self-demotion.
///
/// If the in-memory store is unreachable at startup (or disabled), the
/// coordinator runs in fallback mode: permanently follower, so the webhook
/// layer refuses all signals. Fail-closed beats uncoordinated execution.
#[derive(Clone)]
pub struct RedisCoordinator {
    inner: Arc<Inner>,
}

impl RedisCoordinator {
    pub async fn connect(config: CoordinatorConfig, db: Option<Arc<dyn LeaderStore>>) -> Self {
        let instance_id =
            crate::instance::load_or_create_instance_id(&config.instance_id_path, std::process::id());
        let hostname = hostname();

        let conn = if !config.enable_redis {
            tracing::warn!("redis disabled in config, running in fallback (follower-only) mode");
            None
        } else {
            match Self::open(&config.redis_url).await {
                Ok(conn) => {
                    tracing::info!(instance_id = %instance_id, "redis coordinator initialized");
                    Some(conn)
                }
                Err(e) => {
                    tracing::error!(error = %e, "redis unreachable at startup, enabling fallback mode");
                    None
                }
            }
        };

        let metrics = CoordinatorMetrics::new(
            config.heartbeat_stale_warning_secs,
            config.heartbeat_stale_critical_secs,
        );

        let coordinator = Self {
            inner: Arc::new(Inner {
                instance_id,
                hostname,
                config,
                conn,
                db,
                is_leader: Mutex::new(false),
                metrics,
                heartbeat_iteration: AtomicU64::new(0),
            }),
        };

        // Publish our row immediately so the fleet sees this instance.
        coordinator.sync_leader_status_to_db().await;
        coordinator
    }

    async fn open(url: &str) -> Result<ConnectionManager> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        anyhow::ensure!(pong == "PONG", "unexpected PING reply: {pong}");
        Ok(conn)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn is_available(&self) -> bool {
        self.inner.conn.is_some()
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.is_leader.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn check_alerts(&self) -> Alerts {
        self.inner.metrics.check_alerts(Utc::now())
    }

    /// The heartbeat task is the only writer of the leader flag; this setter
    /// records transitions in metrics, the instance row and the leadership
    /// history.
    async fn set_leader(&self, value: bool) {
        let changed = {
            let mut guard = self.inner.is_leader.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *guard != value;
            *guard = value;
            changed
        };
        if changed {
            self.inner.metrics.record_leadership_change(Utc::now());
            self.sync_leader_status_to_db().await;
            if let Some(db) = &self.inner.db {
                if let Err(e) = db
                    .record_leadership_transition(&self.inner.instance_id, value, &self.inner.hostname)
                    .await
                {
                    tracing::warn!(error = %e, "failed to record leadership transition");
                }
            }
        }
    }

    async fn sync_leader_status_to_db(&self) {
        let Some(db) = &self.inner.db else { return };
        let started = std::time::Instant::now();
        let result = db
            .upsert_instance_metadata(
                &self.inner.instance_id,
                self.is_leader(),
                "active",
                &self.inner.hostname,
            )
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(()) => self.inner.metrics.record_db_sync(true, latency_ms),
            Err(e) => {
                tracing::warn!(error = %e, "failed to sync leader status to database");
                self.inner.metrics.record_db_sync(false, latency_ms);
            }
        }
    }

    async fn update_heartbeat_in_db(&self) {
        self.sync_leader_status_to_db().await;
        self.inner.metrics.update_heartbeat_time(Utc::now());
    }

    /// Attempt to become leader with an atomic set-if-absent + TTL. If the
    /// key already holds our id (re-entrant call or crash-restart with the
    /// same identity), renew instead.
    pub async fn elect_leader(&self) -> bool {
        let Some(conn) = &self.inner.conn else { return false };
        let mut conn = conn.clone();

        let acquired: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(LEADER_KEY)
            .arg(&self.inner.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.inner.config.leader_ttl.as_secs())
            .query_async(&mut conn)
            .await;

        match acquired {
            Ok(Some(_)) => {
                self.set_leader(true).await;
                tracing::error!(instance_id = %self.inner.instance_id, "BECAME LEADER - now processing signals");
                true
            }
            Ok(None) => {
                // Key held. If we already consider ourselves leader, the TTL
                // may be about to lapse: renew atomically.
                if self.is_leader() {
                    if self.renew_leadership().await {
                        tracing::debug!(instance_id = %self.inner.instance_id, "already leader, renewed TTL");
                        return true;
                    }
                }
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis error in leader election");
                false
            }
        }
    }

    /// Renew the lease via the server-side compare-and-extend script. Any
    /// non-1 return means the lease is gone: transition to follower.
    pub async fn renew_leadership(&self) -> bool {
        let Some(conn) = &self.inner.conn else { return false };
        if !self.is_leader() {
            return false;
        }
        let mut conn = conn.clone();

        let renewed: Result<i64, redis::RedisError> = Script::new(RENEW_SCRIPT)
            .key(LEADER_KEY)
            .arg(&self.inner.instance_id)
            .arg(self.inner.config.leader_ttl.as_secs())
            .invoke_async(&mut conn)
            .await;

        match renewed {
            Ok(1) => true,
            Ok(_) => {
                self.set_leader(false).await;
                tracing::error!(instance_id = %self.inner.instance_id, "LOST LEADERSHIP - stopped processing signals");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "redis error renewing leadership");
                self.set_leader(false).await;
                false
            }
        }
    }

    /// Release the lease via compare-and-delete. Always leaves us follower.
    pub async fn release_leadership(&self) -> bool {
        let Some(conn) = &self.inner.conn else { return false };
        if !self.is_leader() {
            return false;
        }
        let mut conn = conn.clone();

        let released: Result<i64, redis::RedisError> = Script::new(RELEASE_SCRIPT)
            .key(LEADER_KEY)
            .arg(&self.inner.instance_id)
            .invoke_async(&mut conn)
            .await;

        let ok = matches!(released, Ok(1));
        if let Err(e) = released {
            tracing::warn!(error = %e, "redis error releasing leadership");
        }
        self.set_leader(false).await;
        if ok {
            tracing::error!(instance_id = %self.inner.instance_id, "released leadership gracefully");
        }
        ok
    }

    /// Publish this instance's liveness key (`pm:heartbeat:{id}`) with a
    /// short TTL so peers can spot dead instances without the relational
    /// store.
    async fn publish_heartbeat_key(&self) {
        let Some(conn) = &self.inner.conn else { return };
        let mut conn = conn.clone();
        let key = format!("{HEARTBEAT_PREFIX}{}", self.inner.instance_id);
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(&key)
            .arg(Utc::now().to_rfc3339())
            .arg("EX")
            .arg(HEARTBEAT_TTL_SECS)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to publish heartbeat key");
        }
    }

    /// Short-lived per-signal lock (`pm:signal_lock:{fingerprint}`) closing
    /// the window where a webhook retry lands on a freshly elected leader
    /// while the old leader is still mid-signal.
    pub async fn acquire_signal_lock(&self, fingerprint: &str) -> bool {
        let Some(conn) = &self.inner.conn else {
            // Fallback mode has a single instance by definition.
            return true;
        };
        let mut conn = conn.clone();
        let key = format!("{SIGNAL_LOCK_PREFIX}{fingerprint}");
        let acquired: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.inner.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(SIGNAL_LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await;
        match acquired {
            Ok(Some(_)) => true,
            Ok(None) => {
                tracing::warn!(fingerprint, "signal lock already held elsewhere");
                false
            }
            Err(e) => {
                // Lock is an extra guard on top of leader election; a store
                // hiccup must not drop the signal.
                tracing::warn!(error = %e, "signal lock error, proceeding under leader lease");
                true
            }
        }
    }

    pub async fn release_signal_lock(&self, fingerprint: &str) {
        let Some(conn) = &self.inner.conn else { return };
        let mut conn = conn.clone();
        let key = format!("{SIGNAL_LOCK_PREFIX}{fingerprint}");
        let released: Result<i64, redis::RedisError> = Script::new(RELEASE_SCRIPT)
            .key(&key)
            .arg(&self.inner.instance_id)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = released {
            tracing::warn!(error = %e, "failed to release signal lock");
        }
    }

    pub async fn current_leader(&self) -> Option<String> {
        let conn = self.inner.conn.as_ref()?;
        let mut conn = conn.clone();
        match redis::cmd("GET").arg(LEADER_KEY).query_async::<Option<String>>(&mut conn).await {
            Ok(leader) => leader,
            Err(e) => {
                tracing::warn!(error = %e, "redis error reading leader key");
                None
            }
        }
    }

    /// Compare the in-memory leader against the relational-store leader.
    /// Returns the conflicting pair when they disagree.
    pub async fn detect_split_brain(&self) -> Option<SplitBrain> {
        let db = self.inner.db.as_ref()?;

        let redis_leader = self.current_leader().await;
        let db_leader = match db.get_current_leader(true).await {
            Ok(row) => row.map(|r| r.instance_id),
            Err(e) => {
                tracing::error!(error = %e, "error reading database leader for split-brain check");
                return None;
            }
        };

        let conflict = match (&redis_leader, &db_leader) {
            (Some(r), Some(d)) => r != d,
            (Some(_), None) | (None, Some(_)) => true,
            (None, None) => false,
        };

        conflict.then_some(SplitBrain { redis_leader, db_leader })
    }

    /// One heartbeat iteration: publish our row, periodically cross-check
    /// for split-brain (self-demoting when the relational store names a
    /// different fresh leader), then renew or campaign.
    pub async fn heartbeat_once(&self) {
        let iteration = self.inner.heartbeat_iteration.fetch_add(1, Ordering::Relaxed) + 1;

        self.update_heartbeat_in_db().await;
        self.publish_heartbeat_key().await;

        if self.inner.config.split_brain_check_every > 0
            && iteration % self.inner.config.split_brain_check_every == 0
        {
            if let Some(conflict) = self.detect_split_brain().await {
                tracing::error!(
                    redis_leader = ?conflict.redis_leader,
                    db_leader = ?conflict.db_leader,
                    "SPLIT-BRAIN DETECTED"
                );
                // Two leaders processing the same signal doubles the
                // position. If the relational store names someone else,
                // demote ourselves immediately.
                if let Some(db_leader) = &conflict.db_leader {
                    if db_leader != &self.inner.instance_id {
                        tracing::error!(
                            instance_id = %self.inner.instance_id,
                            db_leader = %db_leader,
                            "self-demoting due to split-brain"
                        );
                        self.release_leadership().await;
                    }
                }
            }
        }

        if self.is_leader() {
            if !self.renew_leadership().await {
                tracing::debug!(
                    instance_id = %self.inner.instance_id,
                    "renewal failed, will retry acquisition next cycle"
                );
            }
        } else if self.elect_leader().await {
            tracing::error!(
                instance_id = %self.inner.instance_id,
                "acquired leadership via heartbeat"
            );
        }
    }

    fn renewal_interval(&self) -> Duration {
        self.inner.config.leader_ttl.mul_f64(self.inner.config.renewal_ratio)
    }

    /// Spawn the heartbeat loop. Returns a stop handle; dropping it does not
    /// stop the loop, call [`HeartbeatHandle::stop`].
    pub fn start_heartbeat(&self) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let coordinator = self.clone();

        let task = tokio::spawn(async move {
            tracing::info!(
                instance_id = %coordinator.inner.instance_id,
                renewal_secs = coordinator.renewal_interval().as_secs_f64(),
                election_secs = coordinator.inner.config.election_interval.as_secs_f64(),
                "heartbeat loop started"
            );
            loop {
                if coordinator.inner.conn.is_none() {
                    tracing::debug!("heartbeat idle - fallback mode");
                }
                coordinator.heartbeat_once().await;

                let interval = if coordinator.is_leader() {
                    coordinator.renewal_interval()
                } else {
                    coordinator.inner.config.election_interval
                };

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(instance_id = %coordinator.inner.instance_id, "heartbeat loop stopped");
        });

        HeartbeatHandle { stop_tx, task, coordinator: self.clone() }
    }
}

pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    coordinator: RedisCoordinator,
}

impl HeartbeatHandle {
    /// Signal the loop to stop, release leadership, and join with a timeout.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.stop_tx.send(true);
        if self.coordinator.is_leader() {
            self.coordinator.release_leadership().await;
        }
        match tokio::time::timeout(timeout, self.task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("heartbeat task did not stop within {:?}", timeout);
                false
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
