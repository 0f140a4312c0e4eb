//! Table DDL, applied idempotently at startup.

pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS portfolio_positions (
        position_id TEXT PRIMARY KEY,
        instrument TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        entry_timestamp TIMESTAMPTZ NOT NULL,
        entry_price DOUBLE PRECISION NOT NULL,
        lots INTEGER NOT NULL,
        quantity INTEGER NOT NULL,
        initial_stop DOUBLE PRECISION NOT NULL,
        current_stop DOUBLE PRECISION NOT NULL,
        highest_close DOUBLE PRECISION NOT NULL,
        atr DOUBLE PRECISION NOT NULL DEFAULT 0,
        unrealized_pnl DOUBLE PRECISION NOT NULL DEFAULT 0,
        realized_pnl DOUBLE PRECISION NOT NULL DEFAULT 0,
        exit_reason TEXT,
        limiter TEXT,
        risk_contribution DOUBLE PRECISION NOT NULL DEFAULT 0,
        vol_contribution DOUBLE PRECISION NOT NULL DEFAULT 0,
        is_base_position BOOLEAN NOT NULL DEFAULT FALSE,
        strike BIGINT,
        expiry TEXT,
        put_symbol TEXT,
        call_symbol TEXT,
        put_order_id TEXT,
        call_order_id TEXT,
        put_entry_price DOUBLE PRECISION,
        call_entry_price DOUBLE PRECISION,
        futures_symbol TEXT,
        futures_order_id TEXT,
        contract_month TEXT,
        rollover_status TEXT NOT NULL DEFAULT 'none',
        rollover_count INTEGER NOT NULL DEFAULT 0,
        rollover_pnl DOUBLE PRECISION NOT NULL DEFAULT 0,
        rollover_timestamp TIMESTAMPTZ,
        original_expiry TEXT,
        original_strike BIGINT,
        original_entry_price DOUBLE PRECISION,
        version BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS portfolio_state (
        id INTEGER PRIMARY KEY,
        closed_equity DOUBLE PRECISION NOT NULL,
        equity_high DOUBLE PRECISION NOT NULL,
        total_risk_amount DOUBLE PRECISION NOT NULL DEFAULT 0,
        total_vol_amount DOUBLE PRECISION NOT NULL DEFAULT 0,
        margin_used DOUBLE PRECISION NOT NULL DEFAULT 0,
        initial_capital DOUBLE PRECISION NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pyramiding_state (
        instrument TEXT PRIMARY KEY,
        last_pyramid_price DOUBLE PRECISION NOT NULL,
        base_position_id TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS signal_log (
        id BIGSERIAL PRIMARY KEY,
        fingerprint TEXT NOT NULL UNIQUE,
        instrument TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        position TEXT NOT NULL,
        signal_timestamp TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_by_instance TEXT NOT NULL,
        processing_status TEXT NOT NULL,
        payload JSONB,
        is_duplicate BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS signal_audit (
        id BIGSERIAL PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        instrument TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        position TEXT NOT NULL,
        signal_timestamp TIMESTAMPTZ NOT NULL,
        received_at TIMESTAMPTZ NOT NULL,
        outcome TEXT NOT NULL,
        outcome_reason TEXT NOT NULL,
        validation JSONB,
        sizing JSONB,
        risk JSONB,
        order_execution JSONB,
        processing_ms BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instance_metadata (
        instance_id TEXT PRIMARY KEY,
        started_at TIMESTAMPTZ NOT NULL,
        last_heartbeat TIMESTAMPTZ NOT NULL,
        is_leader BOOLEAN NOT NULL DEFAULT FALSE,
        leader_acquired_at TIMESTAMPTZ,
        status TEXT NOT NULL DEFAULT 'active',
        hostname TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leadership_history (
        id BIGSERIAL PRIMARY KEY,
        instance_id TEXT NOT NULL,
        became_leader_at TIMESTAMPTZ NOT NULL,
        released_leader_at TIMESTAMPTZ,
        leadership_duration_seconds INTEGER,
        hostname TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_signal_log_processed_at ON signal_log (processed_at)",
    "CREATE INDEX IF NOT EXISTS idx_signal_audit_fingerprint ON signal_audit (fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_positions_status ON portfolio_positions (status)",
];
