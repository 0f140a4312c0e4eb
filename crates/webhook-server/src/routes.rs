use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use eod_scheduler::PositionStatusView;
use signal_core::signal::validate_position_label;
use signal_core::{Instrument, Signal, SignalKind};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/webhook/stats", get(stats))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    (
        status,
        Json(json!({
            "status": "error",
            "error_type": error_type,
            "message": message,
            "request_id": request_id,
        })),
    )
        .into_response()
}

/// Signal admission: parse, validate structure, gate on leadership, dedup,
/// re-check leadership and dispatch to the engine.
async fn webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4().to_string()[..8].to_string();

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "malformed webhook body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                &format!("invalid JSON: {e}"),
                &request_id,
            );
        }
    };

    let (signal, eod_intent, eod_claim) = match parse_signal(&payload) {
        Ok(parsed) => parsed,
        Err(message) => {
            tracing::warn!(request_id = %request_id, message = %message, "webhook failed structural validation");
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                &message,
                &request_id,
            );
        }
    };

    // Leader gate: followers refuse signals outright.
    if !state.leader.is_leader() {
        tracing::warn!(
            request_id = %request_id,
            instance_id = state.leader.instance_id(),
            "rejecting signal, not leader"
        );
        return error_response(StatusCode::FORBIDDEN, "not_leader", "instance is not the leader", &request_id);
    }

    // Dedup: the in-memory window first, then the durable log.
    let fingerprint = signal.fingerprint();
    let mut duplicate = state.dedup.is_duplicate(&fingerprint, Utc::now());
    if !duplicate {
        if let Some(db) = &state.db {
            match db.check_duplicate_signal(&fingerprint).await {
                Ok(hit) => duplicate = hit,
                Err(e) => {
                    tracing::warn!(error = %e, "durable dedup check failed, relying on cache")
                }
            }
        }
    }
    if duplicate {
        tracing::info!(request_id = %request_id, fingerprint = %fingerprint, "duplicate signal ignored");
        return (
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "error_type": "duplicate",
                "fingerprint": fingerprint,
                "request_id": request_id,
            })),
        )
            .into_response();
    }

    // Leadership can lapse between admission and dispatch; re-check inside
    // the race window rather than executing as a deposed leader.
    if !state.leader.is_leader() {
        tracing::warn!(request_id = %request_id, "leadership lost mid-request");
        return error_response(
            StatusCode::FORBIDDEN,
            "lost_leadership",
            "leadership lost while processing",
            &request_id,
        );
    }

    // Per-signal lock in the shared store: a webhook retry that lands on a
    // freshly elected leader must not run while the deposed leader is still
    // mid-signal.
    if !state.leader.acquire_signal_lock(&fingerprint).await {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "ignored",
                "error_type": "duplicate",
                "message": "signal lock held by another instance",
                "fingerprint": fingerprint,
                "request_id": request_id,
            })),
        )
            .into_response();
    }

    let outcome = if signal.kind == SignalKind::EodMonitor {
        state.engine.process_eod_monitor(signal, eod_intent, eod_claim).await
    } else {
        state.engine.process_signal(&signal).await
    };

    state.leader.release_signal_lock(&fingerprint).await;

    if outcome.status == "error" {
        tracing::error!(request_id = %request_id, reason = ?outcome.reason, "signal processing error");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "processing_error",
            outcome.reason.as_deref().unwrap_or("unknown"),
            &request_id,
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "processed",
            "request_id": request_id,
            "result": outcome,
        })),
    )
        .into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    let mut body = json!({
        "stats": {
            "duplicate_detector": state.dedup.stats(),
            "engine": state.engine.stats().snapshot(),
        }
    });
    if let Some(coordinator) = &state.coordinator {
        body["stats"]["coordinator"] = json!({
            "metrics": coordinator.metrics_snapshot(),
            "alerts": coordinator.check_alerts(),
            "is_leader": coordinator.is_leader(),
            "instance_id": coordinator.instance_id(),
        });
    }
    // Fleet view from the relational store: instances with stale heartbeats
    // and the recent leadership trail.
    if let Some(db) = &state.db {
        let stale_instances = match db.get_stale_instances(30.0).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "stale-instance query failed");
                Vec::new()
            }
        };
        let leadership_history = match db.get_leadership_history(10).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "leadership-history query failed");
                Vec::new()
            }
        };
        body["stats"]["store"] = json!({
            "stale_instances": stale_instances,
            "leadership_history": leadership_history,
        });
    }
    (StatusCode::OK, Json(body)).into_response()
}

fn field<'a>(payload: &'a Value, key: &str) -> Result<&'a Value, String> {
    payload.get(key).ok_or_else(|| format!("Missing required field: {key}"))
}

fn number_field(payload: &Value, key: &str) -> Result<f64, String> {
    field(payload, key)?
        .as_f64()
        .ok_or_else(|| format!("Invalid numeric field: {key}"))
}

/// Structural validation of the webhook body. Semantic checks (freshness,
/// price sanity, divergence) belong to the engine's validator; this layer
/// only guarantees shape.
fn parse_signal(
    payload: &Value,
) -> Result<(Signal, Option<SignalKind>, Option<PositionStatusView>), String> {
    let instrument = field(payload, "instrument")?
        .as_str()
        .ok_or_else(|| "Invalid field: instrument".to_string())?;
    let instrument = Instrument::parse(instrument).map_err(|e| e.to_string())?;

    let kind = field(payload, "type")?
        .as_str()
        .ok_or_else(|| "Invalid field: type".to_string())?;
    let kind = SignalKind::parse(kind).map_err(|e| e.to_string())?;

    let position = field(payload, "position")?
        .as_str()
        .ok_or_else(|| "Invalid field: position".to_string())?
        .to_string();
    validate_position_label(&position, kind == SignalKind::Exit).map_err(|e| e.to_string())?;

    // Timezone-aware timestamps only; naive timestamps are ambiguous at the
    // freshness boundary and are refused at the door.
    let raw_timestamp = field(payload, "timestamp")?
        .as_str()
        .ok_or_else(|| "Invalid field: timestamp".to_string())?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(raw_timestamp)
        .map_err(|_| format!("Invalid timestamp (RFC-3339 with timezone required): {raw_timestamp}"))?
        .with_timezone(&Utc);

    let price = number_field(payload, "price")?;
    let stop = match payload.get("stop") {
        Some(Value::Null) | None => None,
        Some(value) => Some(value.as_f64().ok_or_else(|| "Invalid numeric field: stop".to_string())?),
    };
    if stop.is_none() && matches!(kind, SignalKind::BaseEntry | SignalKind::Pyramid) {
        return Err("Missing required field: stop".to_string());
    }

    let suggested_lots = payload.get("suggested_lots").and_then(Value::as_i64).map(|v| v as i32);
    let atr = payload.get("atr").and_then(Value::as_f64).unwrap_or(0.0);
    let er = payload.get("er").and_then(Value::as_f64).unwrap_or(0.0);
    let supertrend = payload.get("supertrend").and_then(Value::as_f64).unwrap_or(0.0);
    let reason = payload.get("reason").and_then(Value::as_str).map(str::to_string);

    if kind == SignalKind::Exit && reason.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return Err("Missing required field: reason".to_string());
    }

    let signal = Signal {
        instrument,
        kind,
        position,
        timestamp,
        price,
        stop,
        suggested_lots,
        atr,
        er,
        supertrend,
        reason,
    };

    // EOD monitor extras: the scout's proposed action and claimed position
    // state, both optional.
    let eod_intent = payload
        .get("action")
        .and_then(Value::as_str)
        .and_then(|s| SignalKind::parse(s).ok());
    let eod_claim = payload.get("in_position").and_then(Value::as_bool).map(|in_position| {
        PositionStatusView {
            in_position,
            pyramid_count: payload
                .get("pyramid_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        }
    });

    Ok((signal, eod_intent, eod_claim))
}
