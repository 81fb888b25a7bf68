use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use config_store::ConfigStore;
use core_types::{EntityId, ParameterRef};
use governance_engine::{OperatorCommand, OperatorOp};
use serde::Deserialize;

use super::*;
use crate::config_loader::RiskPatch;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1_000;

pub(super) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/summary", get(state_summary))
        .route("/state/parameters", get(state_parameters))
        .route("/state/entities", get(state_entities))
        .route("/state/twin", get(state_twin))
        .route("/report/history", get(report_history))
        .route("/control/entity/pause", post(pause_entity))
        .route("/control/entity/resume", post(resume_entity))
        .route("/control/entity/retire", post(retire_entity))
        .route("/control/cycle", post(trigger_cycle))
        .route("/control/reload_risk", post(reload_risk))
        .route("/control/parameter/reset_baseline", post(reset_baseline))
        .with_state(state)
}

type JsonResp = (StatusCode, Json<serde_json::Value>);

fn error_json(code: StatusCode, err: impl std::fmt::Display) -> JsonResp {
    (
        code,
        Json(serde_json::json!({"ok": false, "error": err.to_string()})),
    )
}

pub(super) async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pending = state.engine.commands().len();
    match state.engine.status() {
        Ok(status) => Json(serde_json::json!({
            "status": "ok",
            "cycle_seq": status.cycle_seq,
            "store_version": status.store_version,
            "failover_triggered": status.twin.failover_triggered,
            "pending_commands": pending,
        })),
        Err(err) => Json(serde_json::json!({
            "status": "degraded",
            "error": err.to_string(),
            "pending_commands": pending,
        })),
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub(super) async fn state_summary(State(state): State<AppState>) -> Json<Option<CycleSummary>> {
    Json(state.last_summary.read().await.clone())
}

pub(super) async fn state_parameters(State(state): State<AppState>) -> JsonResp {
    match state.engine.status() {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status.parameters))),
        Err(err) => error_json(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

async fn state_entities(State(state): State<AppState>) -> JsonResp {
    match state.engine.status() {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "entities": status.entities,
                "pending_commands": status.pending_commands,
            })),
        ),
        Err(err) => error_json(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

async fn state_twin(State(state): State<AppState>) -> JsonResp {
    match state.engine.status() {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status.twin))),
        Err(err) => error_json(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    pub(super) limit: Option<usize>,
}

pub(super) async fn report_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> JsonResp {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.engine.history(limit) {
        Ok(rows) => (StatusCode::OK, Json(serde_json::json!(rows))),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct EntityCommandReq {
    pub(super) entity: String,
    #[serde(default)]
    pub(super) reason: String,
}

/// Queue the command; the next cycle applies it inside its own commit.
fn queue_command(
    state: &AppState,
    op: OperatorOp,
    req: EntityCommandReq,
) -> JsonResp {
    let entity: EntityId = match req.entity.parse() {
        Ok(entity) => entity,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, err),
    };
    let pending = state.engine.commands().push(OperatorCommand {
        entity: entity.clone(),
        op,
        reason: req.reason.trim().to_string(),
        requested_at_ms: state.clock.now_ms(),
    });
    tracing::info!(%entity, op = op.as_str(), pending, "operator command queued");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "ok": true,
            "entity": entity.to_string(),
            "op": op.as_str(),
            "pending": pending,
        })),
    )
}

pub(super) async fn pause_entity(
    State(state): State<AppState>,
    Json(req): Json<EntityCommandReq>,
) -> JsonResp {
    queue_command(&state, OperatorOp::Pause, req)
}

pub(super) async fn resume_entity(
    State(state): State<AppState>,
    Json(req): Json<EntityCommandReq>,
) -> JsonResp {
    queue_command(&state, OperatorOp::Resume, req)
}

pub(super) async fn retire_entity(
    State(state): State<AppState>,
    Json(req): Json<EntityCommandReq>,
) -> JsonResp {
    queue_command(&state, OperatorOp::Retire, req)
}

pub(super) async fn trigger_cycle(State(state): State<AppState>) -> JsonResp {
    match run_cycle_now(&state).await {
        Ok(summary) => (StatusCode::OK, Json(serde_json::json!(summary))),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

pub(super) async fn reload_risk(
    State(state): State<AppState>,
    Json(req): Json<RiskPatch>,
) -> Json<RiskLimits> {
    let mut cfg = state.risk_limits.write().unwrap_or_else(|e| e.into_inner());
    req.apply_to(&mut cfg);
    let snapshot = cfg.clone();
    tracing::info!(?snapshot, "risk limits reloaded");
    Json(snapshot)
}

#[derive(Debug, Deserialize)]
pub(super) struct ResetBaselineReq {
    /// `scope:key/name`
    pub(super) parameter: String,
}

/// Re-anchor a parameter's drift budget at its current value. Writes through the
/// per-parameter revision check so a concurrent cycle commit is never overwritten.
pub(super) async fn reset_baseline(
    State(state): State<AppState>,
    Json(req): Json<ResetBaselineReq>,
) -> JsonResp {
    let pref: ParameterRef = match req.parameter.parse() {
        Ok(pref) => pref,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, err),
    };
    let store = state.engine.store();
    let stored = match store.get_parameter(&pref) {
        Ok(Some(stored)) => stored,
        Ok(None) => return error_json(StatusCode::NOT_FOUND, format!("unknown parameter {pref}")),
        Err(err) => return error_json(StatusCode::SERVICE_UNAVAILABLE, err),
    };
    let mut next = stored.state.clone();
    next.reset_baseline(state.clock.now_ms());
    match store.compare_and_swap_parameter(&pref, stored.revision, next.clone()) {
        Ok(revision) => {
            tracing::info!(parameter = %pref, baseline = next.baseline, revision, "baseline reset");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "ok": true,
                    "parameter": pref.to_string(),
                    "baseline": next.baseline,
                    "revision": revision,
                })),
            )
        }
        Err(err) if err.is_conflict() => error_json(StatusCode::CONFLICT, err),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}
