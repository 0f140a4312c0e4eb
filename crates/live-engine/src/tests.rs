use std::sync::Arc;

use chrono::{Duration, Utc};

use broker_gateway::testing::ScriptedBroker;
use broker_gateway::OrderType;
use eod_scheduler::PositionStatusView;
use signal_core::{Instrument, ServiceConfig, Signal, SignalKind};

use crate::engine::LiveEngine;

fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::from_env().expect("defaults");
    config.eod_enabled = true;
    config.signal_validation_enabled = true;
    config.test_mode = false;
    config.enable_auto_rollover = true;
    config
}

fn engine_with(broker: Arc<ScriptedBroker>, config: ServiceConfig) -> Arc<LiveEngine> {
    Arc::new(
        LiveEngine::new(config, broker, None, None, "test-instance-1".to_string())
            .expect("engine construction"),
    )
}

fn base_entry_signal(instrument: Instrument, price: f64, stop: f64) -> Signal {
    Signal {
        instrument,
        kind: SignalKind::BaseEntry,
        position: "Long_1".to_string(),
        timestamp: Utc::now() - Duration::seconds(5),
        price,
        stop: Some(stop),
        suggested_lots: Some(1),
        atr: 200.0,
        er: 0.5,
        supertrend: price - 400.0,
        reason: None,
    }
}

/// Seed an open Gold Mini base position through the normal entry path.
async fn seed_gold_position(broker: &Arc<ScriptedBroker>, engine: &Arc<LiveEngine>) {
    broker.set_quote(75_000.0, 74_990.0, 75_010.0);
    broker.push_fill(75_000.0, 1);
    let outcome = engine
        .process_signal(&base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0))
        .await;
    assert_eq!(outcome.status, "executed", "seed entry failed: {:?}", outcome.reason);
}

#[tokio::test]
async fn base_entry_happy_path_creates_base_position() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    broker.set_quote(75_000.0, 74_990.0, 75_010.0);
    broker.push_fill(75_005.0, 1);

    let signal = base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0);
    let outcome = engine.process_signal(&signal).await;

    assert_eq!(outcome.status, "executed");
    assert_eq!(outcome.detail["lots"], 1);
    assert_eq!(outcome.detail["position_id"], "GOLD_MINI_Long_1");

    let portfolio = engine.portfolio.lock().await;
    let position = portfolio.position("GOLD_MINI_Long_1").expect("position exists");
    assert!(position.is_base_position);
    assert_eq!(position.entry_price, 75_005.0);
    assert_eq!(position.quantity, 100);
    assert_eq!(
        portfolio.base_position_id(Instrument::GoldMini).map(String::as_str),
        Some("GOLD_MINI_Long_1")
    );
    assert_eq!(portfolio.last_pyramid_price(Instrument::GoldMini), Some(75_000.0));
    drop(portfolio);

    assert_eq!(
        engine.stats().entries_executed.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    // One quote for stage-2 validation plus the limit order.
    assert_eq!(broker.placed_count(), 1);
    assert_eq!(broker.placed.lock().unwrap()[0].order_type, OrderType::Limit);
}

#[tokio::test]
async fn stale_signal_is_rejected_without_broker_calls() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());

    let mut signal = base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0);
    signal.timestamp = Utc::now() - Duration::seconds(70);

    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "rejected");
    assert_eq!(outcome.reason.as_deref(), Some("validation_failed"));
    assert_eq!(outcome.detail["validation_stage"], "condition");
    assert_eq!(outcome.detail["validation_reason"], "signal_stale");
    assert_eq!(broker.placed_count(), 0);
}

#[tokio::test]
async fn excessive_divergence_is_rejected_without_order() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    // Signal 75,000 vs broker mid 77,500: > 2% divergence; no confirmation
    // manager is wired, so the default (reject) is taken.
    broker.set_quote(77_500.0, 77_490.0, 77_510.0);

    let outcome = engine
        .process_signal(&base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0))
        .await;

    assert_eq!(outcome.status, "rejected");
    assert_eq!(outcome.detail["validation_stage"], "execution");
    assert_eq!(outcome.detail["validation_reason"], "excessive_divergence");
    assert_eq!(broker.placed_count(), 0);
}

#[tokio::test]
async fn margin_constraint_uses_broker_funds() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    // Thin margin at the broker: one lot, even though the tight stop leaves
    // the risk budget room for three.
    broker.set_funds(300_000.0);
    broker.set_quote(75_000.0, 74_990.0, 75_010.0);
    broker.push_fill(75_000.0, 1);

    let outcome = engine
        .process_signal(&base_entry_signal(Instrument::GoldMini, 75_000.0, 74_750.0))
        .await;
    assert_eq!(outcome.status, "executed", "entry failed: {:?}", outcome.reason);
    assert_eq!(outcome.detail["lots"], 1);

    let portfolio = engine.portfolio.lock().await;
    let position = portfolio.position("GOLD_MINI_Long_1").expect("position exists");
    assert_eq!(position.limiter.as_deref(), Some("margin"));
}

#[tokio::test]
async fn zero_broker_funds_blocks_entry() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    // Funds endpoint reports nothing deployable: sizing fails closed before
    // any quote or order reaches the broker.
    broker.set_funds(0.0);

    let outcome = engine
        .process_signal(&base_entry_signal(Instrument::GoldMini, 75_000.0, 74_750.0))
        .await;
    assert_eq!(outcome.status, "blocked");
    assert_eq!(outcome.reason.as_deref(), Some("zero_lots_limited_by_margin"));
    assert_eq!(broker.placed_count(), 0);
}

#[tokio::test]
async fn zero_lots_is_blocked_with_risk_limiter() {
    let broker = Arc::new(ScriptedBroker::new());
    let mut config = test_config();
    config.initial_capital = 100_000.0; // far too small for one lot
    let engine = engine_with(broker.clone(), config);

    let outcome = engine
        .process_signal(&base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0))
        .await;

    assert_eq!(outcome.status, "blocked");
    assert_eq!(outcome.reason.as_deref(), Some("zero_lots_limited_by_risk"));
    assert_eq!(broker.placed_count(), 0);
}

#[tokio::test]
async fn pyramid_without_base_is_blocked() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());

    let mut signal = base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0);
    signal.kind = SignalKind::Pyramid;
    signal.position = "Long_2".to_string();

    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "blocked");
    assert_eq!(outcome.reason.as_deref(), Some("no_base_position"));
}

#[tokio::test]
async fn pyramid_gate_requires_atr_advance() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    seed_gold_position(&broker, &engine).await;

    // Price barely moved since entry: gate blocks before any broker call.
    let mut signal = base_entry_signal(Instrument::GoldMini, 75_050.0, 74_600.0);
    signal.kind = SignalKind::Pyramid;
    signal.position = "Long_2".to_string();

    let placed_before = broker.placed_count();
    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "blocked");
    assert!(outcome.reason.unwrap().starts_with("insufficient_advance"));
    assert_eq!(broker.placed_count(), placed_before);
}

#[tokio::test]
async fn pyramid_with_house_money_executes() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    seed_gold_position(&broker, &engine).await;

    // Price advanced 1,000 points (> 1 ATR); base risk was 500 x 100 and
    // unrealized is 1,000 x 100, so one lot of house money is available.
    broker.set_quote(76_000.0, 75_990.0, 76_010.0);
    broker.push_fill(76_005.0, 1);

    let mut signal = base_entry_signal(Instrument::GoldMini, 76_000.0, 75_500.0);
    signal.kind = SignalKind::Pyramid;
    signal.position = "Long_2".to_string();

    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "executed", "pyramid failed: {:?}", outcome.reason);

    let portfolio = engine.portfolio.lock().await;
    let pyramid = portfolio.position("GOLD_MINI_Long_2").expect("pyramid exists");
    assert!(!pyramid.is_base_position);
    assert_eq!(portfolio.last_pyramid_price(Instrument::GoldMini), Some(76_000.0));
}

#[tokio::test]
async fn exit_closes_position_and_clears_base() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    seed_gold_position(&broker, &engine).await;

    // Exit at 75,800: quote for the close limit, then the sell order fill.
    broker.set_quote(75_800.0, 75_790.0, 75_810.0);
    broker.push_fill(75_800.0, 1);

    let mut signal = base_entry_signal(Instrument::GoldMini, 75_800.0, 74_500.0);
    signal.kind = SignalKind::Exit;
    signal.reason = Some("TREND_FLIP".to_string());

    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "executed", "exit failed: {:?}", outcome.reason);
    assert_eq!(outcome.detail["positions_closed"], 1);
    // (75,800 − 75,000) × 1 lot × 100 point value.
    assert_eq!(outcome.detail["pnl"], 80_000.0);

    let portfolio = engine.portfolio.lock().await;
    assert!(portfolio.base_position(Instrument::GoldMini).is_none());
    assert_eq!(portfolio.closed_equity, 5_080_000.0);
    let closed = portfolio.position("GOLD_MINI_Long_1").expect("row kept");
    assert_eq!(closed.status, signal_core::PositionStatus::Closed);
    assert_eq!(closed.exit_reason.as_deref(), Some("TREND_FLIP"));
}

#[tokio::test]
async fn exit_all_closes_in_label_order() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    seed_gold_position(&broker, &engine).await;

    // Add a pyramid so ALL has two positions to close.
    broker.set_quote(76_000.0, 75_990.0, 76_010.0);
    broker.push_fill(76_005.0, 1);
    let mut pyramid = base_entry_signal(Instrument::GoldMini, 76_000.0, 75_500.0);
    pyramid.kind = SignalKind::Pyramid;
    pyramid.position = "Long_2".to_string();
    assert_eq!(engine.process_signal(&pyramid).await.status, "executed");

    broker.set_quote(76_200.0, 76_190.0, 76_210.0);
    broker.push_fill(76_200.0, 1); // Long_1 close
    broker.push_fill(76_200.0, 1); // Long_2 close

    let mut exit = base_entry_signal(Instrument::GoldMini, 76_200.0, 74_500.0);
    exit.kind = SignalKind::Exit;
    exit.position = "ALL".to_string();
    exit.reason = Some("EXIT_ALL".to_string());

    let outcome = engine.process_signal(&exit).await;
    assert_eq!(outcome.status, "executed");
    assert_eq!(outcome.detail["positions_closed"], 2);

    let portfolio = engine.portfolio.lock().await;
    assert!(portfolio.open_positions_for(Instrument::GoldMini).is_empty());
}

#[tokio::test]
async fn market_data_trails_stop_and_exits_on_breach() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    seed_gold_position(&broker, &engine).await;

    // Rally: stop trails up to 76,000 − 2 × 200 = 75,600.
    let mut tick = base_entry_signal(Instrument::GoldMini, 76_000.0, 74_500.0);
    tick.kind = SignalKind::MarketData;
    tick.stop = None;
    let outcome = engine.process_signal(&tick).await;
    assert_eq!(outcome.status, "processed");
    assert_eq!(outcome.detail["stops_updated"][0]["new_stop"], 75_600.0);
    assert!(outcome.detail["exits_triggered"].as_array().unwrap().is_empty());

    // Breach: price under the trailed stop triggers a PM exit.
    broker.set_quote(75_500.0, 75_490.0, 75_510.0);
    broker.push_fill(75_500.0, 1);
    let mut breach = tick.clone();
    breach.price = 75_500.0;
    breach.timestamp = Utc::now();

    let outcome = engine.process_signal(&breach).await;
    assert_eq!(outcome.status, "processed");
    let exits = outcome.detail["exits_triggered"].as_array().unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0]["result"]["status"], "closed");

    let portfolio = engine.portfolio.lock().await;
    let closed = portfolio.position("GOLD_MINI_Long_1").expect("row kept");
    assert_eq!(closed.status, signal_core::PositionStatus::Closed);
    assert_eq!(closed.exit_reason.as_deref(), Some("PM_STOP_HIT"));
    drop(portfolio);
    assert_eq!(
        engine.stats().pm_stop_exits.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn eod_executed_fingerprint_skips_bar_close_signal() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());

    let signal = base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0);
    engine
        .eod_monitor()
        .mark_executed(&signal.eod_fingerprint(), SignalKind::BaseEntry);

    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "skipped");
    assert_eq!(outcome.reason.as_deref(), Some("already_executed_at_eod"));
    assert_eq!(broker.placed_count(), 0);
}

#[tokio::test]
async fn test_mode_executes_one_lot_regardless_of_sizing() {
    let broker = Arc::new(ScriptedBroker::new());
    let mut config = test_config();
    config.test_mode = true;
    config.initial_capital = 50_000_000.0; // sized to many lots
    let engine = engine_with(broker.clone(), config);

    broker.set_quote(75_000.0, 74_990.0, 75_010.0);
    broker.push_fill(75_000.0, 1);

    let outcome = engine
        .process_signal(&base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0))
        .await;
    assert_eq!(outcome.status, "executed");
    assert_eq!(outcome.detail["lots"], 1);
    // The broker saw exactly one lot's quantity.
    assert_eq!(broker.placed.lock().unwrap()[0].quantity, 100);
}

#[tokio::test]
async fn synthetic_base_entry_places_two_legs() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());

    broker.set_quote(50_000.0, 49_990.0, 50_010.0);
    broker.push_fill(118.0, 1); // put sell
    broker.push_fill(95.0, 1); // call buy

    let signal = base_entry_signal(Instrument::BankNifty, 50_000.0, 49_800.0);
    let outcome = engine.process_signal(&signal).await;
    assert_eq!(outcome.status, "executed", "entry failed: {:?}", outcome.reason);

    let portfolio = engine.portfolio.lock().await;
    let position = portfolio.position("BANK_NIFTY_Long_1").expect("position exists");
    assert_eq!(position.strike, Some(50_000));
    assert!(position.put_symbol.as_deref().unwrap().ends_with("PE"));
    assert!(position.call_symbol.as_deref().unwrap().ends_with("CE"));
    // Synthetic entry price: strike + call − put.
    assert_eq!(position.entry_price, 50_000.0 + 95.0 - 118.0);
    drop(portfolio);

    let placed = broker.placed.lock().unwrap();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[0].action, broker_gateway::OrderAction::Sell);
    assert_eq!(placed[1].action, broker_gateway::OrderAction::Buy);
}

#[tokio::test]
async fn eod_condition_check_honors_database_truth() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());

    // Scout claims an open position and proposes a pyramid; the book is
    // actually flat, so nothing may run.
    let mut signal = base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0);
    signal.kind = SignalKind::EodMonitor;
    signal.suggested_lots = Some(10);
    engine
        .process_eod_monitor(
            signal.clone(),
            Some(SignalKind::Pyramid),
            Some(PositionStatusView { in_position: true, pyramid_count: 1 }),
        )
        .await;

    let check = engine.eod_condition_check(Instrument::GoldMini).await;
    assert_eq!(check["action_required"], false);

    // Open a position: the store now agrees and the action proceeds.
    seed_gold_position(&broker, &engine).await;
    let check = engine.eod_condition_check(Instrument::GoldMini).await;
    assert_eq!(check["action_required"], true);
    assert_eq!(check["signal_type"], "PYRAMID");
    assert_eq!(check["lots"], 10);
}

#[tokio::test]
async fn eod_execute_and_track_fill_flow() {
    let broker = Arc::new(ScriptedBroker::new());
    let engine = engine_with(broker.clone(), test_config());
    seed_gold_position(&broker, &engine).await;

    let mut signal = base_entry_signal(Instrument::GoldMini, 75_000.0, 74_500.0);
    signal.kind = SignalKind::EodMonitor;
    signal.position = "Long_2".to_string();
    signal.suggested_lots = Some(10);
    engine
        .process_eod_monitor(signal.clone(), Some(SignalKind::Pyramid), None)
        .await;

    let check = engine.eod_condition_check(Instrument::GoldMini).await;
    assert_eq!(check["action_required"], true);

    // T−30: limit order goes out at the live mid.
    broker.set_quote(75_100.0, 75_090.0, 75_110.0);
    let exec = engine.eod_execute(Instrument::GoldMini).await;
    assert_eq!(exec["success"], true);
    assert_eq!(exec["action_taken"], true);
    assert!(exec["order_id"].as_str().is_some());

    // T−15: tracker finds the order filled.
    broker.push_fill(75_100.0, 10);
    let track = engine.eod_track(Instrument::GoldMini).await;
    assert_eq!(track["success"], true);
    assert_eq!(track["filled"], true);
    assert_eq!(track["fallback_used"], false);

    // The pyramid landed in the portfolio and the bar is marked executed.
    let portfolio = engine.portfolio.lock().await;
    assert!(portfolio.position("GOLD_MINI_Long_1").is_some());
    assert_eq!(portfolio.open_position_count(Instrument::GoldMini), 2);
    drop(portfolio);
    assert!(engine
        .eod_monitor()
        .was_executed_at_eod(&signal.eod_fingerprint(), SignalKind::Pyramid));

    // The same bar arriving as a webhook pyramid is now skipped.
    let mut bar_close = signal.clone();
    bar_close.kind = SignalKind::Pyramid;
    bar_close.position = "Long_2".to_string();
    let outcome = engine.process_signal(&bar_close).await;
    assert_eq!(outcome.status, "skipped");
    assert_eq!(outcome.reason.as_deref(), Some("already_executed_at_eod"));
}
