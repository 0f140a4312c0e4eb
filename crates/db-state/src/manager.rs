use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use redis_coordinator::{DbLeader, LeaderStore};
use signal_core::{AuditRecord, Instrument, Position, PositionStatus, RolloverStatus, Signal};

use crate::schema::SCHEMA;

/// Single portfolio-state row (table keyed by a fixed id).
#[derive(Debug, Clone)]
pub struct PortfolioStateRecord {
    pub closed_equity: f64,
    pub equity_high: f64,
    pub total_risk_amount: f64,
    pub total_vol_amount: f64,
    pub margin_used: f64,
    pub initial_capital: f64,
}

#[derive(Debug, Clone)]
pub struct PyramidingStateRecord {
    pub instrument: Instrument,
    pub last_pyramid_price: f64,
    pub base_position_id: Option<String>,
}

/// One closed or open span in the leadership audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct LeadershipSpan {
    pub instance_id: String,
    pub became_leader_at: DateTime<Utc>,
    pub released_leader_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleInstance {
    pub instance_id: String,
    pub is_leader: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub hostname: Option<String>,
    pub seconds_stale: f64,
}

const PORTFOLIO_STATE_ID: i32 = 1;

/// Persistent state manager backed by PostgreSQL.
///
/// Positions are cached process-locally (write-through) so the hot read path
/// avoids a round trip; the cache is only ever populated by the leader.
pub struct DbStateManager {
    pool: PgPool,
    position_cache: DashMap<String, Position>,
}

fn is_transient(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// Retry an operation once on transient connection loss.
async fn retry_once<T, F, Fut>(op: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match op().await {
        Err(e) if is_transient(&e) => {
            tracing::warn!(error = %e, "transient database error, retrying once");
            tokio::time::sleep(Duration::from_millis(500)).await;
            op().await
        }
        other => other,
    }
}

impl DbStateManager {
    /// Connect with exponential backoff (1s, 2s, 4s) up to 3 attempts and
    /// apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut last_err = None;
        let mut pool = None;
        for attempt in 0..3u32 {
            match PgPoolOptions::new()
                .min_connections(2)
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(5))
                .connect(database_url)
                .await
            {
                Ok(p) => {
                    tracing::info!(attempt = attempt + 1, "database connection pool initialized");
                    pool = Some(p);
                    break;
                }
                Err(e) => {
                    let wait = 1u64 << attempt;
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "database connection failed, retrying in {wait}s"
                    );
                    last_err = Some(e);
                    if attempt < 2 {
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    }
                }
            }
        }
        let pool = match (pool, last_err) {
            (Some(p), _) => p,
            (None, Some(e)) => return Err(e).context("database connection failed after 3 attempts"),
            (None, None) => unreachable!(),
        };

        let manager = Self { pool, position_cache: DashMap::new() };
        manager.init_schema().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ===== Positions =====

    /// Upsert a position, bumping the optimistic-concurrency version. The
    /// cached copy is refreshed with the stored version.
    pub async fn save_position(&self, position: &Position) -> Result<i64> {
        let version: i64 = retry_once(|| async {
            let row = sqlx::query(
                r#"
                INSERT INTO portfolio_positions
                (position_id, instrument, status, entry_timestamp, entry_price, lots, quantity,
                 initial_stop, current_stop, highest_close, atr, unrealized_pnl, realized_pnl,
                 exit_reason, limiter, risk_contribution, vol_contribution, is_base_position,
                 strike, expiry, put_symbol, call_symbol, put_order_id, call_order_id,
                 put_entry_price, call_entry_price, futures_symbol, futures_order_id,
                 contract_month, rollover_status, rollover_count, rollover_pnl,
                 rollover_timestamp, original_expiry, original_strike, original_entry_price,
                 version, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,
                        $21,$22,$23,$24,$25,$26,$27,$28,$29,$30,$31,$32,$33,$34,$35,$36,0,NOW())
                ON CONFLICT (position_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    entry_timestamp = EXCLUDED.entry_timestamp,
                    entry_price = EXCLUDED.entry_price,
                    lots = EXCLUDED.lots,
                    quantity = EXCLUDED.quantity,
                    initial_stop = EXCLUDED.initial_stop,
                    current_stop = EXCLUDED.current_stop,
                    highest_close = EXCLUDED.highest_close,
                    atr = EXCLUDED.atr,
                    unrealized_pnl = EXCLUDED.unrealized_pnl,
                    realized_pnl = EXCLUDED.realized_pnl,
                    exit_reason = EXCLUDED.exit_reason,
                    limiter = EXCLUDED.limiter,
                    risk_contribution = EXCLUDED.risk_contribution,
                    vol_contribution = EXCLUDED.vol_contribution,
                    is_base_position = EXCLUDED.is_base_position,
                    strike = EXCLUDED.strike,
                    expiry = EXCLUDED.expiry,
                    put_symbol = EXCLUDED.put_symbol,
                    call_symbol = EXCLUDED.call_symbol,
                    put_order_id = EXCLUDED.put_order_id,
                    call_order_id = EXCLUDED.call_order_id,
                    put_entry_price = EXCLUDED.put_entry_price,
                    call_entry_price = EXCLUDED.call_entry_price,
                    futures_symbol = EXCLUDED.futures_symbol,
                    futures_order_id = EXCLUDED.futures_order_id,
                    contract_month = EXCLUDED.contract_month,
                    rollover_status = EXCLUDED.rollover_status,
                    rollover_count = EXCLUDED.rollover_count,
                    rollover_pnl = EXCLUDED.rollover_pnl,
                    rollover_timestamp = EXCLUDED.rollover_timestamp,
                    original_expiry = EXCLUDED.original_expiry,
                    original_strike = EXCLUDED.original_strike,
                    original_entry_price = EXCLUDED.original_entry_price,
                    version = portfolio_positions.version + 1,
                    updated_at = NOW()
                RETURNING version
                "#,
            )
            .bind(&position.position_id)
            .bind(position.instrument.as_str())
            .bind(position.status.as_str())
            .bind(position.entry_timestamp)
            .bind(position.entry_price)
            .bind(position.lots)
            .bind(position.quantity)
            .bind(position.initial_stop)
            .bind(position.current_stop)
            .bind(position.highest_close)
            .bind(position.atr)
            .bind(position.unrealized_pnl)
            .bind(position.realized_pnl)
            .bind(&position.exit_reason)
            .bind(&position.limiter)
            .bind(position.risk_contribution)
            .bind(position.vol_contribution)
            .bind(position.is_base_position)
            .bind(position.strike)
            .bind(&position.expiry)
            .bind(&position.put_symbol)
            .bind(&position.call_symbol)
            .bind(&position.put_order_id)
            .bind(&position.call_order_id)
            .bind(position.put_entry_price)
            .bind(position.call_entry_price)
            .bind(&position.futures_symbol)
            .bind(&position.futures_order_id)
            .bind(&position.contract_month)
            .bind(position.rollover_status.as_str())
            .bind(position.rollover_count)
            .bind(position.rollover_pnl)
            .bind(position.rollover_timestamp)
            .bind(&position.original_expiry)
            .bind(position.original_strike)
            .bind(position.original_entry_price)
            .fetch_one(&self.pool)
            .await?;
            row.try_get::<i64, _>("version")
        })
        .await?;

        let mut cached = position.clone();
        cached.version = version;
        self.position_cache.insert(position.position_id.clone(), cached);
        Ok(version)
    }

    pub async fn get_position(&self, position_id: &str) -> Result<Option<Position>> {
        if let Some(cached) = self.position_cache.get(position_id) {
            return Ok(Some(cached.clone()));
        }
        let row = sqlx::query("SELECT * FROM portfolio_positions WHERE position_id = $1")
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let position = row_to_position(&row)?;
                self.position_cache.insert(position.position_id.clone(), position.clone());
                Ok(Some(position))
            }
            None => Ok(None),
        }
    }

    /// All non-closed positions, ordered by id. Used for crash recovery and
    /// the rollover scan; warms the cache.
    pub async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM portfolio_positions WHERE status != 'closed' ORDER BY position_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in &rows {
            let position = row_to_position(row)?;
            self.position_cache.insert(position.position_id.clone(), position.clone());
            positions.push(position);
        }
        Ok(positions)
    }

    // ===== Portfolio / pyramiding state =====

    pub async fn save_portfolio_state(&self, state: &PortfolioStateRecord) -> Result<()> {
        retry_once(|| async {
            sqlx::query(
                r#"
                INSERT INTO portfolio_state
                (id, closed_equity, equity_high, total_risk_amount, total_vol_amount,
                 margin_used, initial_capital, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,NOW())
                ON CONFLICT (id) DO UPDATE SET
                    closed_equity = EXCLUDED.closed_equity,
                    equity_high = EXCLUDED.equity_high,
                    total_risk_amount = EXCLUDED.total_risk_amount,
                    total_vol_amount = EXCLUDED.total_vol_amount,
                    margin_used = EXCLUDED.margin_used,
                    initial_capital = EXCLUDED.initial_capital,
                    updated_at = NOW()
                "#,
            )
            .bind(PORTFOLIO_STATE_ID)
            .bind(state.closed_equity)
            .bind(state.equity_high)
            .bind(state.total_risk_amount)
            .bind(state.total_vol_amount)
            .bind(state.margin_used)
            .bind(state.initial_capital)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await?;
        Ok(())
    }

    pub async fn get_portfolio_state(&self) -> Result<Option<PortfolioStateRecord>> {
        let row = sqlx::query("SELECT * FROM portfolio_state WHERE id = $1")
            .bind(PORTFOLIO_STATE_ID)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(PortfolioStateRecord {
                closed_equity: row.try_get("closed_equity")?,
                equity_high: row.try_get("equity_high")?,
                total_risk_amount: row.try_get("total_risk_amount")?,
                total_vol_amount: row.try_get("total_vol_amount")?,
                margin_used: row.try_get("margin_used")?,
                initial_capital: row.try_get("initial_capital")?,
            })
        })
        .transpose()
    }

    pub async fn save_pyramiding_state(
        &self,
        instrument: Instrument,
        last_pyramid_price: f64,
        base_position_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pyramiding_state (instrument, last_pyramid_price, base_position_id, updated_at)
            VALUES ($1,$2,$3,NOW())
            ON CONFLICT (instrument) DO UPDATE SET
                last_pyramid_price = EXCLUDED.last_pyramid_price,
                base_position_id = EXCLUDED.base_position_id,
                updated_at = NOW()
            "#,
        )
        .bind(instrument.as_str())
        .bind(last_pyramid_price)
        .bind(base_position_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pyramiding_state(&self) -> Result<Vec<PyramidingStateRecord>> {
        let rows = sqlx::query("SELECT * FROM pyramiding_state").fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let instrument: String = row.try_get("instrument")?;
            let Ok(instrument) = Instrument::parse(&instrument) else {
                tracing::warn!(instrument = %instrument, "skipping pyramiding row for unknown instrument");
                continue;
            };
            records.push(PyramidingStateRecord {
                instrument,
                last_pyramid_price: row.try_get("last_pyramid_price")?,
                base_position_id: row.try_get("base_position_id")?,
            });
        }
        Ok(records)
    }

    // ===== Signal log / audit =====

    /// Whether the fingerprint was already logged within the last 60 seconds.
    pub async fn check_duplicate_signal(&self, fingerprint: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS hit FROM signal_log
            WHERE fingerprint = $1
              AND processed_at > NOW() - make_interval(secs => 60)
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Log a signal for dedup purposes. Re-inserting the same fingerprint
    /// marks the existing row as a duplicate instead of failing.
    pub async fn log_signal(
        &self,
        signal: &Signal,
        fingerprint: &str,
        instance_id: &str,
        status: &str,
    ) -> Result<()> {
        let payload = serde_json::to_value(signal)?;
        sqlx::query(
            r#"
            INSERT INTO signal_log
            (fingerprint, instrument, signal_type, position, signal_timestamp,
             processed_by_instance, processing_status, payload)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (fingerprint) DO UPDATE SET is_duplicate = TRUE
            "#,
        )
        .bind(fingerprint)
        .bind(signal.instrument.as_str())
        .bind(signal.kind.as_str())
        .bind(&signal.position)
        .bind(signal.timestamp)
        .bind(instance_id)
        .bind(status)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_audit(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signal_audit
            (fingerprint, instrument, signal_type, position, signal_timestamp, received_at,
             outcome, outcome_reason, validation, sizing, risk, order_execution, processing_ms)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            "#,
        )
        .bind(&record.fingerprint)
        .bind(record.instrument.as_str())
        .bind(record.kind.as_str())
        .bind(&record.position)
        .bind(record.signal_timestamp)
        .bind(record.received_at)
        .bind(record.outcome.as_str())
        .bind(&record.outcome_reason)
        .bind(record.validation.as_ref().map(serde_json::to_value).transpose()?)
        .bind(record.sizing.as_ref().map(serde_json::to_value).transpose()?)
        .bind(record.risk.as_ref().map(serde_json::to_value).transpose()?)
        .bind(record.order.as_ref().map(serde_json::to_value).transpose()?)
        .bind(record.processing_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== Instance metadata / leadership =====

    pub async fn upsert_instance_metadata_row(
        &self,
        instance_id: &str,
        is_leader: bool,
        status: &str,
        hostname: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instance_metadata
            (instance_id, started_at, last_heartbeat, is_leader, leader_acquired_at,
             status, hostname, updated_at)
            VALUES ($1, NOW(), NOW(), $2, CASE WHEN $2 THEN NOW() END, $3, $4, NOW())
            ON CONFLICT (instance_id) DO UPDATE SET
                last_heartbeat = NOW(),
                is_leader = EXCLUDED.is_leader,
                leader_acquired_at = CASE
                    WHEN EXCLUDED.is_leader AND NOT instance_metadata.is_leader THEN NOW()
                    ELSE instance_metadata.leader_acquired_at
                END,
                status = EXCLUDED.status,
                hostname = COALESCE(EXCLUDED.hostname, instance_metadata.hostname),
                updated_at = NOW()
            "#,
        )
        .bind(instance_id)
        .bind(is_leader)
        .bind(status)
        .bind(hostname)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Instances whose heartbeat is older than `timeout_seconds`.
    pub async fn get_stale_instances(&self, timeout_seconds: f64) -> Result<Vec<StaleInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, is_leader, last_heartbeat, hostname,
                   EXTRACT(EPOCH FROM (NOW() - last_heartbeat))::DOUBLE PRECISION AS seconds_stale
            FROM instance_metadata
            WHERE EXTRACT(EPOCH FROM (NOW() - last_heartbeat)) > $1
            ORDER BY last_heartbeat ASC
            "#,
        )
        .bind(timeout_seconds)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StaleInstance {
                    instance_id: row.try_get("instance_id")?,
                    is_leader: row.try_get("is_leader")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                    hostname: row.try_get("hostname")?,
                    seconds_stale: row.try_get("seconds_stale")?,
                })
            })
            .collect()
    }

    /// The fleet's leader per the relational store, filtered to fresh
    /// heartbeats. `force_fresh` runs a sync-point query on the same pooled
    /// connection first so the select observes all committed transactions.
    pub async fn get_current_leader_row(&self, force_fresh: bool) -> Result<Option<DbLeader>> {
        let mut conn = self.pool.acquire().await?;
        if force_fresh {
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
        }
        let row = sqlx::query(
            r#"
            SELECT instance_id, hostname, leader_acquired_at, last_heartbeat
            FROM instance_metadata
            WHERE is_leader = TRUE
              AND last_heartbeat >= NOW() - make_interval(secs => 30)
            ORDER BY last_heartbeat DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|row| {
            Ok(DbLeader {
                instance_id: row.try_get("instance_id")?,
                hostname: row.try_get("hostname")?,
                leader_acquired_at: row.try_get("leader_acquired_at")?,
                last_heartbeat: row.try_get("last_heartbeat")?,
            })
        })
        .transpose()
    }

    /// Most recent leadership spans, newest first.
    pub async fn get_leadership_history(&self, limit: i64) -> Result<Vec<LeadershipSpan>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, became_leader_at, released_leader_at,
                   leadership_duration_seconds, hostname
            FROM leadership_history
            ORDER BY became_leader_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LeadershipSpan {
                    instance_id: row.try_get("instance_id")?,
                    became_leader_at: row.try_get("became_leader_at")?,
                    released_leader_at: row.try_get("released_leader_at")?,
                    duration_seconds: row.try_get("leadership_duration_seconds")?,
                    hostname: row.try_get("hostname")?,
                })
            })
            .collect()
    }

    /// Drop dedup-log rows past their usefulness. The dedup window is 60
    /// seconds; anything older only serves forensic queries, which the audit
    /// table covers better.
    pub async fn purge_signal_log(&self, older_than_days: f64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM signal_log WHERE processed_at < NOW() - ($1 * INTERVAL '1 day')",
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "purged aged signal-log rows");
        }
        Ok(purged)
    }

    /// Append to the leadership audit trail. Becoming leader opens a new
    /// history row; releasing closes the latest open row (fallback insert
    /// when none exists, e.g. after a crash).
    pub async fn record_leadership_transition_row(
        &self,
        instance_id: &str,
        became_leader: bool,
        hostname: &str,
    ) -> Result<()> {
        if became_leader {
            sqlx::query(
                "INSERT INTO leadership_history (instance_id, became_leader_at, hostname)
                 VALUES ($1, NOW(), $2)",
            )
            .bind(instance_id)
            .bind(hostname)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE leadership_history
            SET released_leader_at = NOW(),
                leadership_duration_seconds =
                    EXTRACT(EPOCH FROM (NOW() - became_leader_at))::INTEGER
            WHERE id = (
                SELECT id FROM leadership_history
                WHERE instance_id = $1 AND released_leader_at IS NULL
                ORDER BY became_leader_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(instance_id, "no open leadership record found, inserting closed row");
            sqlx::query(
                r#"
                INSERT INTO leadership_history
                (instance_id, became_leader_at, released_leader_at, leadership_duration_seconds, hostname)
                VALUES ($1, NOW(), NOW(), 0, $2)
                "#,
            )
            .bind(instance_id)
            .bind(hostname)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LeaderStore for DbStateManager {
    async fn upsert_instance_metadata(
        &self,
        instance_id: &str,
        is_leader: bool,
        status: &str,
        hostname: &str,
    ) -> Result<()> {
        self.upsert_instance_metadata_row(instance_id, is_leader, status, hostname).await
    }

    async fn get_current_leader(&self, force_fresh: bool) -> Result<Option<DbLeader>> {
        self.get_current_leader_row(force_fresh).await
    }

    async fn record_leadership_transition(
        &self,
        instance_id: &str,
        became_leader: bool,
        hostname: &str,
    ) -> Result<()> {
        self.record_leadership_transition_row(instance_id, became_leader, hostname).await
    }
}

fn row_to_position(row: &PgRow) -> Result<Position> {
    let instrument: String = row.try_get("instrument")?;
    let instrument = Instrument::parse(&instrument)?;
    let status: String = row.try_get("status")?;
    let rollover_status: String = row.try_get("rollover_status")?;

    Ok(Position {
        position_id: row.try_get("position_id")?,
        instrument,
        status: PositionStatus::parse(&status),
        entry_timestamp: row.try_get("entry_timestamp")?,
        entry_price: row.try_get("entry_price")?,
        lots: row.try_get("lots")?,
        quantity: row.try_get("quantity")?,
        initial_stop: row.try_get("initial_stop")?,
        current_stop: row.try_get("current_stop")?,
        highest_close: row.try_get("highest_close")?,
        atr: row.try_get("atr")?,
        unrealized_pnl: row.try_get("unrealized_pnl")?,
        realized_pnl: row.try_get("realized_pnl")?,
        exit_reason: row.try_get("exit_reason")?,
        limiter: row.try_get("limiter")?,
        risk_contribution: row.try_get("risk_contribution")?,
        vol_contribution: row.try_get("vol_contribution")?,
        is_base_position: row.try_get("is_base_position")?,
        strike: row.try_get("strike")?,
        expiry: row.try_get("expiry")?,
        put_symbol: row.try_get("put_symbol")?,
        call_symbol: row.try_get("call_symbol")?,
        put_order_id: row.try_get("put_order_id")?,
        call_order_id: row.try_get("call_order_id")?,
        put_entry_price: row.try_get("put_entry_price")?,
        call_entry_price: row.try_get("call_entry_price")?,
        futures_symbol: row.try_get("futures_symbol")?,
        futures_order_id: row.try_get("futures_order_id")?,
        contract_month: row.try_get("contract_month")?,
        rollover_status: RolloverStatus::parse(&rollover_status),
        rollover_count: row.try_get("rollover_count")?,
        rollover_pnl: row.try_get("rollover_pnl")?,
        rollover_timestamp: row.try_get("rollover_timestamp")?,
        original_expiry: row.try_get("original_expiry")?,
        original_strike: row.try_get("original_strike")?,
        original_entry_price: row.try_get("original_entry_price")?,
        version: row.try_get("version")?,
    })
}
