use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use broker_gateway::GatewayClient;
use confirmation_manager::{
    spawn_update_listener, ConfirmationManager, DialogChannel, TelegramChannel,
};
use db_state::DbStateManager;
use eod_scheduler::{EodScheduleConfig, EodScheduler};
use live_engine::{EngineEodHandler, LiveEngine};
use redis_coordinator::{CoordinatorConfig, LeaderStore, RedisCoordinator};
use signal_core::ServiceConfig;
use signal_validation::DuplicateDetector;
use webhook_server::{AppState, LeaderGate};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> Result<()> {
    let config = ServiceConfig::from_env().context("loading configuration")?;

    // Relational store first: the coordinator audits leadership into it.
    let db = Arc::new(
        DbStateManager::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );

    let coordinator = RedisCoordinator::connect(
        CoordinatorConfig {
            redis_url: config.redis_url.clone(),
            enable_redis: config.enable_redis,
            leader_ttl: Duration::from_secs(config.leader_ttl_seconds),
            renewal_ratio: config.heartbeat_renewal_ratio,
            election_interval: Duration::from_secs_f64(config.election_interval_seconds),
            split_brain_check_every: 10,
            instance_id_path: PathBuf::from(".redis_instance_id"),
            heartbeat_stale_warning_secs: config.heartbeat_stale_warning_seconds,
            heartbeat_stale_critical_secs: config.heartbeat_stale_critical_seconds,
        },
        Some(db.clone() as Arc<dyn LeaderStore>),
    )
    .await;
    let heartbeat = coordinator.start_heartbeat();

    // Confirmation channels: chat bot + native dialog, racing.
    let chat = TelegramChannel::new(&config.telegram_bot_token, &config.telegram_chat_id);
    let dialog = DialogChannel::new(&config.dialog_command);
    let confirmations = Arc::new(ConfirmationManager::new(
        chat.clone(),
        dialog,
        Duration::from_secs(config.confirmation_timeout_secs),
    ));
    if let Some(chat) = chat {
        let manager = confirmations.clone();
        spawn_update_listener(chat, Arc::new(move |data: &str| manager.handle_chat_callback(data)));
    }

    let broker = Arc::new(
        GatewayClient::new(&config.broker_base_url, &config.broker_api_key)
            .context("building broker gateway client")?,
    );

    let engine = Arc::new(LiveEngine::new(
        config.clone(),
        broker,
        Some(db.clone()),
        Some(confirmations),
        coordinator.instance_id().to_string(),
    )?);
    engine.restore_state().await.context("restoring engine state")?;

    // Pre-close scheduler.
    let scheduler = if config.eod_enabled {
        let schedule = EodScheduleConfig {
            instruments: config
                .eod_instruments_enabled
                .iter()
                .filter(|(_, enabled)| **enabled)
                .map(|(instrument, _)| *instrument)
                .collect(),
            condition_check_offset: config.eod_condition_check_seconds,
            execution_offset: config.eod_execution_seconds,
            tracking_offset: config.eod_tracking_seconds,
            close_overrides: config
                .eod_close_overrides
                .iter()
                .filter_map(|(instrument, (hour, minute))| {
                    chrono::NaiveTime::from_hms_opt(*hour, *minute, 0)
                        .map(|time| (*instrument, time))
                })
                .collect(),
            ..EodScheduleConfig::default()
        };
        let scheduler = EodScheduler::new(schedule, Arc::new(EngineEodHandler::new(engine.clone())));
        scheduler.start();
        Some(scheduler)
    } else {
        None
    };

    // Hourly housekeeping: rollover sweep (leader only; the engine applies
    // its own market-hours guard) and aged signal-log purge.
    {
        let sweep_engine = engine.clone();
        let sweep_coordinator = coordinator.clone();
        let sweep_db = db.clone();
        let auto_rollover = config.enable_auto_rollover;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                if !sweep_coordinator.is_leader() {
                    continue;
                }
                if auto_rollover {
                    let batch = sweep_engine.run_rollover_check(false).await;
                    if batch.candidates > 0 {
                        tracing::info!(
                            candidates = batch.candidates,
                            rolled = batch.rolled,
                            failed = batch.failed,
                            "rollover sweep complete"
                        );
                    }
                }
                if let Err(e) = sweep_db.purge_signal_log(7.0).await {
                    tracing::warn!(error = %e, "signal-log purge failed");
                }
            }
        });
    }

    let state = AppState {
        engine,
        leader: Arc::new(coordinator.clone()) as Arc<dyn LeaderGate>,
        dedup: Arc::new(DuplicateDetector::new(60)),
        db: Some(db),
        coordinator: Some(coordinator),
    };
    let app = webhook_server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    heartbeat.stop(Duration::from_secs(5)).await;
    tracing::info!("shutdown complete");
    Ok(())
}
