use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use core_types::{EntityId, EntityStatus, OutcomeRecord, ParameterRef, RiskSnapshot};
use feed_jsonl::{OUTCOMES_FILE_NAME, RISK_FILE_NAME};

use super::*;
use crate::config_loader::parse_app_config;
use crate::control_api::{
    health, pause_entity, reload_risk, report_history, reset_baseline, state_parameters,
    state_summary, trigger_cycle, EntityCommandReq, HistoryQuery, ResetBaselineReq,
};

const CONFIG: &str = r#"
[loop]
cycle_budget_ms = 10000

[[parameters]]
entity = "strategy:ema_long"
name = "entry_threshold"
value = 0.08
min = 0.02
max = 0.40
step = 0.04
max_cumulative_drift = 0.12
"#;

const GOOD: [f64; 5] = [0.03, 0.02, 0.02, -0.01, -0.01];

fn ema_long() -> EntityId {
    EntityId::new("strategy", "ema_long")
}

fn threshold() -> ParameterRef {
    ParameterRef::new(ema_long(), "entry_threshold")
}

struct Fixture {
    _dir: tempfile::TempDir,
    layout: DataLayout,
    state: AppState,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = DataLayout::new(dir.path());
    let cfg = parse_app_config(CONFIG).expect("config");
    let state = AppState::new(build_runtime(&cfg, &layout).expect("runtime"), None);
    Fixture {
        _dir: dir,
        layout,
        state,
    }
}

impl Fixture {
    fn write_risk(&self, exposure: f64) {
        let snapshot = RiskSnapshot {
            total_exposure: exposure,
            per_entity_exposure: BTreeMap::from([(ema_long(), exposure)]),
            max_leverage: 1.0,
            as_of_ms: Utc::now().timestamp_millis(),
            ..RiskSnapshot::default()
        };
        JsonlRecorder::open(self.layout.dir("feeds").join(RISK_FILE_NAME))
            .expect("risk feed")
            .write(&snapshot)
            .expect("write risk");
    }

    fn write_outcomes(&self, returns: &[f64]) {
        let now = Utc::now().timestamp_millis();
        let rows = returns
            .iter()
            .enumerate()
            .map(|(i, r)| OutcomeRecord {
                ts_ms: now - (25 - i as i64) * 60_000,
                entity: ema_long(),
                realized_return: *r,
                tags: Vec::new(),
            })
            .collect::<Vec<_>>();
        JsonlRecorder::open(self.layout.dir("feeds").join(OUTCOMES_FILE_NAME))
            .expect("outcome feed")
            .write_all(&rows)
            .expect("write outcomes");
    }

    fn value(&self) -> f64 {
        self.state.engine.status().expect("status").parameters[&threshold()]
            .state
            .value
    }

    fn status_of(&self, entity: &EntityId) -> Option<EntityStatus> {
        self.state
            .engine
            .status()
            .expect("status")
            .entities
            .get(entity)
            .map(|l| l.status)
    }
}

#[test]
fn cli_data_root_wins_over_config_file() {
    let mut cfg = parse_app_config(CONFIG).expect("config");
    assert_eq!(resolve_data_root(None, &cfg), PathBuf::from("datasets"));
    cfg.data_root = Some(PathBuf::from("/srv/govloop"));
    assert_eq!(resolve_data_root(None, &cfg), PathBuf::from("/srv/govloop"));
    assert_eq!(
        resolve_data_root(Some(PathBuf::from("/tmp/override")), &cfg),
        PathBuf::from("/tmp/override")
    );
}

#[test]
fn declared_parameters_are_seeded_once() {
    let fx = fixture();
    assert_eq!(fx.value(), 0.08);
    let cfg = parse_app_config(CONFIG).expect("config");
    // a second runtime over the same root keeps the stored state
    let again = build_runtime(&cfg, &fx.layout).expect("runtime");
    assert_eq!(again.engine.status().expect("status").parameters.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_good_cycles_promote_and_hand_off_the_action() {
    let fx = fixture();
    fx.write_risk(50.0);
    fx.write_outcomes(&GOOD);

    let first = run_cycle_now(&fx.state).await.expect("cycle 1");
    assert!(first.actions.is_empty());
    assert!(!first.fail_closed && !first.cycle_aborted);

    let (code, Json(body)) = trigger_cycle(State(fx.state.clone())).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["cycle_seq"], 2);
    assert_eq!(body["actions"].as_array().map(Vec::len), Some(1));
    assert!((fx.value() - 0.12).abs() < 1e-9);

    let applied = std::fs::read_to_string(fx.layout.dir("reports").join(APPLIED_ACTIONS_FILE_NAME))
        .expect("applied actions");
    assert_eq!(applied.lines().count(), 1);
    assert!(applied.contains("entry_threshold"));

    let Json(last) = state_summary(State(fx.state.clone())).await;
    assert_eq!(last.map(|s| s.cycle_seq), Some(2));

    let (code, Json(rows)) =
        report_history(State(fx.state.clone()), Query(HistoryQuery { limit: Some(10) })).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(rows.as_array().map(Vec::len), Some(2));

    let (code, Json(params)) = state_parameters(State(fx.state.clone())).await;
    assert_eq!(code, StatusCode::OK);
    assert!(params.get("strategy:ema_long/entry_threshold").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_request_waits_for_the_next_cycle() {
    let fx = fixture();
    fx.write_risk(50.0);

    let (code, Json(body)) = pause_entity(
        State(fx.state.clone()),
        Json(EntityCommandReq {
            entity: "strategy:ema_long".to_string(),
            reason: "manual review".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::ACCEPTED);
    assert_eq!(body["pending"], 1);
    assert_ne!(fx.status_of(&ema_long()), Some(EntityStatus::Paused));

    let Json(h) = health(State(fx.state.clone())).await;
    assert_eq!(h["status"], "ok");
    assert_eq!(h["pending_commands"], 1);

    run_cycle_now(&fx.state).await.expect("cycle");
    assert_eq!(fx.status_of(&ema_long()), Some(EntityStatus::Paused));
    assert!(fx.state.engine.commands().is_empty());

    let (code, _) = pause_entity(
        State(fx.state.clone()),
        Json(EntityCommandReq {
            entity: "no-scope".to_string(),
            reason: String::new(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_risk_feed_keeps_commands_queued() {
    let fx = fixture();
    let (code, _) = pause_entity(
        State(fx.state.clone()),
        Json(EntityCommandReq {
            entity: "strategy:ema_long".to_string(),
            reason: String::new(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::ACCEPTED);

    let summary = run_cycle_now(&fx.state).await.expect("cycle");
    assert!(summary.fail_closed);
    assert_eq!(fx.state.engine.commands().len(), 1);
    assert_eq!(fx.value(), 0.08);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reloaded_risk_limits_veto_the_next_cycle() {
    let fx = fixture();
    fx.write_risk(50.0);
    fx.write_outcomes(&GOOD);

    let patch = serde_json::from_value(serde_json::json!({"per_entity_cap": 10.0}))
        .expect("risk patch");
    let Json(limits) = reload_risk(State(fx.state.clone()), Json(patch)).await;
    assert_eq!(limits.per_entity_cap, 10.0);
    assert_eq!(
        fx.state
            .risk_limits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .per_entity_cap,
        10.0
    );

    let summary = run_cycle_now(&fx.state).await.expect("cycle");
    let decision = summary
        .gate_decisions
        .iter()
        .find(|d| d.entity == ema_long())
        .expect("decision");
    assert!(!decision.risk_gate_pass);
    assert!(summary.actions.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn baseline_reset_reanchors_the_drift_budget() {
    let fx = fixture();
    fx.write_risk(50.0);
    fx.write_outcomes(&GOOD);
    run_cycle_now(&fx.state).await.expect("cycle 1");
    run_cycle_now(&fx.state).await.expect("cycle 2");
    assert!((fx.value() - 0.12).abs() < 1e-9);

    let (code, Json(body)) = reset_baseline(
        State(fx.state.clone()),
        Json(ResetBaselineReq {
            parameter: "strategy:ema_long/entry_threshold".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["ok"], true);
    let stored = fx.state.engine.status().expect("status").parameters[&threshold()].clone();
    assert!((stored.state.baseline - 0.12).abs() < 1e-9);
    assert_eq!(body["revision"], stored.revision);

    let (code, _) = reset_baseline(
        State(fx.state.clone()),
        Json(ResetBaselineReq {
            parameter: "strategy:ema_long/missing".to_string(),
        }),
    )
    .await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}
