use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::bail;
use causal_log::{JsonlCausalLog, MemoryCausalLog};
use config_store::{ConfigStore, FileConfigStore, GovernanceDocument, MemoryConfigStore};
use core_types::{
    ActionKind, AttributionRecord, CausalSink, CycleSummary, EntityId, EntityStatus,
    ExecutionBridgeMode, OutcomeRecord, ParameterRef, ParameterState, PromoteDirection,
    RiskSnapshot,
};
use feed_jsonl::{MemoryInterventionFeed, MemoryOutcomeFeed, StaticRiskSource};
use infra_clock::ManualClock;
use risk_engine::{PortfolioRiskGate, RiskLimits};

use crate::{
    EngineDeps, GateThresholds, GovernanceConfig, GovernanceEngine, OperatorCommand, OperatorOp,
    ProfitGate, ProfitVerdict, ThresholdProfitGate,
};

const T0: i64 = 1_760_000_000_000;
const CYCLE_MINS: u64 = 30;

const GOOD: [f64; 5] = [0.03, 0.02, 0.02, -0.01, -0.01];
const BAD: [f64; 5] = [0.01, -0.03, -0.03, -0.03, -0.02];

struct Harness<P: ProfitGate = ThresholdProfitGate> {
    engine: GovernanceEngine<P>,
    store: Arc<MemoryConfigStore>,
    log: Arc<MemoryCausalLog>,
    outcomes: Arc<MemoryOutcomeFeed>,
    risk: Arc<StaticRiskSource>,
    clock: Arc<ManualClock>,
}

fn ema_long() -> EntityId {
    EntityId::new("strategy", "ema_long")
}

fn threshold() -> ParameterRef {
    ParameterRef::new(ema_long(), "entry_threshold")
}

fn param() -> ParameterState {
    ParameterState {
        value: 0.08,
        min: 0.02,
        max: 0.40,
        step: 0.04,
        baseline: 0.08,
        max_cumulative_drift: 0.12,
        promote_direction: PromoteDirection::Increase,
        updated_at_ms: 0,
    }
}

fn harness_with<P: ProfitGate>(cfg: GovernanceConfig, gate: P) -> Harness<P> {
    let store = Arc::new(MemoryConfigStore::new(GovernanceDocument::default()));
    let log = Arc::new(MemoryCausalLog::new());
    let outcomes = Arc::new(MemoryOutcomeFeed::new());
    let risk = Arc::new(StaticRiskSource::default());
    let clock = Arc::new(ManualClock::new(T0));
    let deps = EngineDeps {
        store: store.clone(),
        outcomes: outcomes.clone(),
        interventions: Arc::new(MemoryInterventionFeed::new()),
        risk_source: risk.clone(),
        risk_gate: Arc::new(PortfolioRiskGate::new(Arc::new(RwLock::new(
            RiskLimits::default(),
        )))),
        sink: log.clone(),
        clock: clock.clone(),
    };
    let engine = GovernanceEngine::new(cfg, deps, gate).expect("engine");
    engine
        .seed_parameters(&[(threshold(), param())])
        .expect("seed");
    Harness {
        engine,
        store,
        log,
        outcomes,
        risk,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(GovernanceConfig::default(), ThresholdProfitGate)
}

impl<P: ProfitGate> Harness<P> {
    /// Advance one cycle, land `returns` for `entity` inside the new short window, run.
    fn cycle_for(&self, entity: &EntityId, returns: &[f64]) -> CycleSummary {
        let now = self.clock.advance_mins(CYCLE_MINS);
        self.push_returns(entity, now, returns);
        self.engine.run_cycle()
    }

    fn cycle(&self, returns: &[f64]) -> CycleSummary {
        self.cycle_for(&ema_long(), returns)
    }

    fn push_returns(&self, entity: &EntityId, now: i64, returns: &[f64]) {
        self.outcomes
            .extend(returns.iter().enumerate().map(|(i, r)| OutcomeRecord {
                ts_ms: now - (25 - i as i64) * 60_000,
                entity: entity.clone(),
                realized_return: *r,
                tags: Vec::new(),
            }));
    }

    fn value(&self) -> f64 {
        self.store.snapshot().parameters[&threshold()].state.value
    }

    fn ledger(&self) -> core_types::EntityLedger {
        self.store.snapshot().entities[&ema_long()].clone()
    }
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn promote_after_two_cycles_then_rollback_after_two() {
    let h = harness();

    let s1 = h.cycle(&GOOD);
    assert!(s1.actions.is_empty());
    assert_eq!(h.ledger().streak.promote_count, 1);

    let s2 = h.cycle(&GOOD);
    assert_eq!(s2.actions.len(), 1);
    let promote = &s2.actions[0];
    assert_eq!(promote.kind, ActionKind::Promote);
    assert!(approx(promote.from_value, 0.08));
    assert!(approx(promote.to_value, 0.12));
    assert_eq!(promote.streak_at_apply, 2);
    assert!(approx(h.value(), 0.12));
    assert_eq!(h.ledger().streak.promote_count, 0);
    assert_eq!(h.ledger().open_promotions.len(), 1);

    let s3 = h.cycle(&BAD);
    assert!(s3.actions.is_empty() && s3.rollbacks.is_empty());
    assert_eq!(h.ledger().streak.rollback_count, 1);

    let s4 = h.cycle(&BAD);
    assert_eq!(s4.rollbacks.len(), 1);
    let rollback = &s4.rollbacks[0];
    assert!(approx(rollback.from_value, 0.12));
    assert!(approx(rollback.to_value, 0.08));
    assert_eq!(rollback.reverts.as_deref(), Some(promote.id.as_str()));
    assert!(approx(h.value(), 0.08));
    assert!(h.ledger().open_promotions.is_empty());
    assert_eq!(h.store.snapshot().cycle_seq, 4);
}

#[test]
fn degradation_reverts_only_the_linked_promotion() {
    let mut cfg = GovernanceConfig::default();
    cfg.rollback.watch_cycles = 6;
    let h = harness_with(cfg, ThresholdProfitGate);
    let size = ParameterRef::new(ema_long(), "position_size");
    h.engine
        .seed_parameters(&[(
            size.clone(),
            ParameterState {
                value: 1.0,
                min: 0.5,
                max: 2.0,
                step: 0.25,
                baseline: 1.0,
                max_cumulative_drift: 0.25,
                ..param()
            },
        )])
        .expect("seed size");
    let size_value = || h.store.snapshot().parameters[&size].state.value;

    h.cycle(&GOOD);
    assert_eq!(h.cycle(&GOOD).actions.len(), 2);
    h.cycle(&GOOD);
    let s4 = h.cycle(&GOOD);
    assert_eq!(s4.actions.len(), 1);
    let latest = s4.actions[0].clone();
    assert_eq!(latest.parameter.as_deref(), Some("entry_threshold"));
    assert!(approx(h.value(), 0.16));
    assert!(approx(size_value(), 1.25));

    h.cycle(&BAD);
    let s6 = h.cycle(&BAD);
    assert_eq!(s6.rollbacks.len(), 1);
    assert_eq!(s6.rollbacks[0].reverts.as_deref(), Some(latest.id.as_str()));
    assert!(approx(h.value(), 0.12));
    assert!(approx(size_value(), 1.25));
}

#[test]
fn alternating_cycles_never_act() {
    let h = harness();
    for returns in [GOOD, BAD, GOOD, BAD, GOOD] {
        let s = h.cycle(&returns);
        assert_eq!(s.applied_count(), 0);
    }
    assert!(approx(h.value(), 0.08));
}

#[test]
fn risk_veto_overrides_profit() {
    let h = harness();
    h.risk.update(|s| {
        s.per_entity_exposure.insert(ema_long(), 300.0);
    });
    for _ in 0..2 {
        let s = h.cycle(&GOOD);
        assert!(s.actions.is_empty());
        let decision = &s.gate_decisions[0];
        assert!(decision.profit_gate_pass);
        assert!(!decision.risk_gate_pass);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r.contains("per_entity_cap")));
    }
    assert_eq!(h.ledger().streak.promote_count, 0);
    assert!(h.ledger().risk_vetoed_last_cycle);
    assert!(approx(h.value(), 0.08));
}

#[test]
fn fresh_risk_breach_reverts_watched_promotion_at_once() {
    let h = harness();
    h.cycle(&GOOD);
    let promote = h.cycle(&GOOD).actions[0].clone();

    h.risk.update(|s| {
        s.per_entity_exposure.insert(ema_long(), 300.0);
    });
    let s3 = h.cycle(&GOOD);
    assert_eq!(s3.rollbacks.len(), 1);
    assert_eq!(s3.rollbacks[0].reason, "fresh_risk_breach");
    assert_eq!(s3.rollbacks[0].reverts.as_deref(), Some(promote.id.as_str()));
    assert!(approx(h.value(), 0.08));

    // still breached, but no longer fresh and nothing left to revert
    let s4 = h.cycle(&GOOD);
    assert_eq!(s4.applied_count(), 0);
}

#[test]
fn silence_pauses_without_rollback_and_evidence_resumes() {
    let h = harness();
    h.cycle(&GOOD);
    h.cycle(&GOOD);
    assert!(approx(h.value(), 0.12));

    for _ in 0..2 {
        let s = h.cycle(&[]);
        assert_eq!(s.applied_count(), 0);
    }
    let s5 = h.cycle(&[]);
    assert!(s5.rollbacks.is_empty());
    assert_eq!(s5.actions.len(), 1);
    assert_eq!(s5.actions[0].kind, ActionKind::Pause);
    assert!(s5.actions[0].parameter.is_none());
    assert_eq!(h.ledger().status, EntityStatus::Paused);
    assert!(approx(h.value(), 0.12));

    let s6 = h.cycle(&[0.05; 5]);
    assert_eq!(s6.actions.len(), 1);
    assert_eq!(s6.actions[0].kind, ActionKind::Resume);
    assert_eq!(h.ledger().status, EntityStatus::Active);
    assert!(approx(h.value(), 0.12));
}

#[test]
fn twin_failover_suppresses_promotions_until_clean() {
    let h = harness();
    let other = EntityId::new("strategy", "other");

    h.cycle(&GOOD);

    // portfolio breach that does not veto ema_long
    h.risk.update(|s| {
        s.total_exposure = 1_500.0;
        s.per_entity_exposure.insert(other.clone(), 1_500.0);
    });
    let s2 = h.cycle(&GOOD);
    assert!(s2.twin.failover_triggered);
    assert_eq!(s2.twin.execution_bridge_mode, ExecutionBridgeMode::Twin);
    assert!(s2.promotions_blocked);
    assert!(s2.actions.is_empty());
    assert_eq!(s2.suppressed_promotions.len(), 1);
    assert!(approx(h.value(), 0.08));
    assert!(h.log.edges().iter().any(|e| e.predicate == "suppressed_by"));

    h.risk.set(RiskSnapshot::default());
    let s3 = h.cycle(&GOOD);
    assert!(s3.twin.failover_triggered);

    let s4 = h.cycle(&GOOD);
    assert!(!s4.twin.failover_triggered);
    assert_eq!(s4.actions.len(), 1);
    assert!(approx(h.value(), 0.12));
    assert!(!h.store.snapshot().twin.failover_triggered);
}

#[test]
fn unreadable_store_aborts_cycle_without_writes() {
    let h = harness();
    let writes = h.store.write_count();
    h.store.set_corrupt(Some("truncated json"));
    h.clock.advance_mins(CYCLE_MINS);
    let s = h.engine.run_cycle();
    assert!(s.cycle_aborted);
    assert!(s.promotions_blocked);
    assert!(s
        .abort_reason
        .as_deref()
        .is_some_and(|r| r.contains("truncated json")));
    assert_eq!(h.store.write_count(), writes);
    assert!(h.log.edges().is_empty());
    assert_eq!(h.log.summaries().len(), 1);
}

#[test]
fn outcome_feed_failure_fails_closed() {
    let h = harness();
    h.cycle(&GOOD);
    let writes = h.store.write_count();
    h.engine.commands().push(OperatorCommand {
        entity: ema_long(),
        op: OperatorOp::Pause,
        reason: String::new(),
        requested_at_ms: T0,
    });

    h.outcomes.set_failure(Some("execution log offline"));
    let s = h.cycle(&GOOD);
    assert!(s.fail_closed);
    assert!(s.promotions_blocked);
    assert!(!s.gate_decisions.is_empty());
    assert!(s.gate_decisions.iter().all(|d| d.insufficient_evidence));
    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.store.snapshot().cycle_seq, 1);
    assert_eq!(h.engine.commands().len(), 1);

    // the fail-closed summary is not a usable twin prior
    h.outcomes.set_failure(None);
    let s3 = h.cycle(&GOOD);
    assert!(!s3.fail_closed);
    assert!(!s3.twin.failover_triggered);
    assert_eq!(h.ledger().status, EntityStatus::Paused);
}

#[test]
fn slow_acquisition_exceeds_budget() {
    let mut cfg = GovernanceConfig::default();
    cfg.cycle.cycle_budget_ms = 1;
    let h = harness_with(cfg, ThresholdProfitGate);
    h.outcomes.set_latency(Duration::from_millis(20));
    let s = h.cycle(&GOOD);
    assert!(s.fail_closed);
    assert!(s
        .abort_reason
        .as_deref()
        .is_some_and(|r| r.contains("budget")));
}

#[test]
fn document_conflict_is_retried() {
    let h = harness();
    h.cycle(&GOOD);
    h.store.on_next_store(|doc| doc.updated_at_ms = 7);
    let s = h.cycle(&GOOD);
    assert!(!s.cycle_aborted);
    assert_eq!(s.actions.len(), 1);
    assert!(s.store_conflicts.is_empty());
    assert!(approx(h.value(), 0.12));
}

#[test]
fn failed_commit_keeps_operator_commands_for_the_next_cycle() {
    let h = harness();
    h.cycle(&GOOD);
    h.engine.commands().push(OperatorCommand {
        entity: ema_long(),
        op: OperatorOp::Pause,
        reason: "desk halt".to_string(),
        requested_at_ms: T0,
    });
    for _ in 0..GovernanceConfig::default().cycle.max_commit_attempts {
        h.store.on_next_store(|doc| doc.updated_at_ms += 1);
    }

    let s2 = h.cycle(&GOOD);
    assert!(s2.cycle_aborted);
    assert!(s2
        .abort_reason
        .as_deref()
        .is_some_and(|r| r.starts_with("commit:")));
    assert_eq!(h.engine.commands().len(), 1);
    assert_eq!(h.ledger().status, EntityStatus::Active);
    assert!(approx(h.value(), 0.08));

    let s3 = h.cycle(&GOOD);
    assert!(!s3.cycle_aborted);
    assert!(h.engine.commands().is_empty());
    assert_eq!(h.ledger().status, EntityStatus::Paused);
    assert!(s3.actions.iter().all(|a| a.kind != ActionKind::Promote));
    assert!(approx(h.value(), 0.08));
    let seqs = h.log.summaries().iter().map(|s| s.cycle_seq).collect::<Vec<_>>();
    assert_eq!(seqs, [1, 2, 3]);
}

#[test]
fn cycle_numbers_advance_past_cycles_that_did_not_commit() {
    let h = harness();
    h.cycle(&GOOD);
    h.outcomes.set_failure(Some("execution log offline"));
    assert!(h.cycle(&GOOD).fail_closed);
    h.outcomes.set_failure(None);
    h.store.set_corrupt(Some("torn write"));
    assert!(h.cycle(&GOOD).cycle_aborted);
    h.store.set_corrupt(None);
    let s4 = h.cycle(&GOOD);
    assert!(!s4.fail_closed && !s4.cycle_aborted);

    let seqs = h.log.summaries().iter().map(|s| s.cycle_seq).collect::<Vec<_>>();
    assert_eq!(seqs, [1, 2, 3, 4]);
    assert_eq!(h.store.snapshot().cycle_seq, 4);
    assert_eq!(h.engine.history(10).expect("history").len(), 4);
}

#[test]
fn concurrent_parameter_write_drops_planned_step() {
    let h = harness();
    h.cycle(&GOOD);
    h.store.on_next_store(|doc| {
        if let Some(stored) = doc.parameters.get_mut(&threshold()) {
            stored.set_value(0.10, 1);
        }
    });
    let s = h.cycle(&GOOD);
    assert!(s.actions.is_empty());
    assert_eq!(s.store_conflicts.len(), 1);
    assert!(approx(h.value(), 0.10));
    assert_eq!(h.store.snapshot().cycle_seq, 2);
}

#[test]
fn operator_commands_apply_at_next_cycle() {
    let h = harness();
    let queue = h.engine.commands();
    queue.push(OperatorCommand {
        entity: ema_long(),
        op: OperatorOp::Pause,
        reason: "maintenance".to_string(),
        requested_at_ms: T0,
    });
    assert_eq!(h.engine.status().expect("status").pending_commands.len(), 1);
    assert_eq!(h.store.load().expect("load").entities[&ema_long()].status, EntityStatus::Active);

    let s1 = h.cycle(&[]);
    assert!(queue.is_empty());
    assert_eq!(s1.actions.len(), 1);
    assert_eq!(s1.actions[0].kind, ActionKind::Pause);
    assert_eq!(s1.actions[0].reason, "operator: maintenance");
    assert_eq!(h.ledger().status, EntityStatus::Paused);

    queue.push(OperatorCommand {
        entity: ema_long(),
        op: OperatorOp::Retire,
        reason: String::new(),
        requested_at_ms: T0,
    });
    let s2 = h.cycle(&[]);
    assert_eq!(h.ledger().status, EntityStatus::Retired);
    assert!(s2.gate_decisions.is_empty());

    let s3 = h.cycle(&GOOD);
    assert!(s3.gate_decisions.is_empty());

    queue.push(OperatorCommand {
        entity: ema_long(),
        op: OperatorOp::Resume,
        reason: String::new(),
        requested_at_ms: T0,
    });
    let s4 = h.cycle(&[]);
    assert_eq!(s4.actions[0].kind, ActionKind::Resume);
    assert_eq!(h.ledger().status, EntityStatus::Active);
}

struct BrokenForOne;

impl ProfitGate for BrokenForOne {
    fn evaluate(
        &self,
        rec: &AttributionRecord,
        thresholds: &GateThresholds,
    ) -> anyhow::Result<ProfitVerdict> {
        if rec.entity.key == "broken" {
            bail!("expectancy model unavailable");
        }
        ThresholdProfitGate.evaluate(rec, thresholds)
    }
}

#[test]
fn one_failing_entity_does_not_block_others() {
    let h = harness_with(GovernanceConfig::default(), BrokenForOne);
    let broken = EntityId::new("strategy", "broken");
    let broken_param = ParameterRef::new(broken.clone(), "entry_threshold");
    h.engine
        .seed_parameters(&[(broken_param.clone(), param())])
        .expect("seed");

    for _ in 0..2 {
        let now = h.clock.advance_mins(CYCLE_MINS);
        h.push_returns(&ema_long(), now, &GOOD);
        h.push_returns(&broken, now, &GOOD);
        let s = h.engine.run_cycle();
        assert_eq!(s.entity_errors.len(), 1);
        assert_eq!(s.entity_errors[0].entity, broken);
        assert!(!s.cycle_aborted);
    }
    assert!(approx(h.value(), 0.12));
    assert!(approx(
        h.store.snapshot().parameters[&broken_param].state.value,
        0.08
    ));
    assert!(h
        .log
        .edges()
        .iter()
        .any(|e| e.predicate == "evaluation_error" && e.subject == broken.to_string()));
}

#[test]
fn causal_log_explains_actions() {
    let h = harness();
    h.cycle(&GOOD);
    let promote = h.cycle(&GOOD).actions[0].clone();
    let edges = h.log.edges();
    let subject = format!("action:{}", promote.id);
    assert!(edges
        .iter()
        .any(|e| e.subject == subject && e.predicate == "promote" && e.object.contains("0.080000->0.120000")));
    assert!(edges
        .iter()
        .any(|e| e.cycle_seq == 2 && e.predicate == "gate_decision"));

    // the loop's own promotion shows up as the linked intervention next cycle
    h.cycle(&BAD);
    assert!(h.log.edges().iter().any(|e| e.cycle_seq == 3
        && e.predicate == "linked_intervention"
        && e.object == promote.id));

    let history = h.engine.history(10).expect("history");
    assert_eq!(history.len(), 3);
    assert_eq!(h.log.latest_summary().expect("latest").map(|s| s.cycle_seq), Some(3));
}

#[test]
fn file_backed_state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcomes = Arc::new(MemoryOutcomeFeed::new());
    let clock = Arc::new(ManualClock::new(T0));
    let risk = Arc::new(StaticRiskSource::default());
    let build = || {
        let deps = EngineDeps {
            store: Arc::new(FileConfigStore::in_dir(dir.path())),
            outcomes: outcomes.clone(),
            interventions: Arc::new(MemoryInterventionFeed::new()),
            risk_source: risk.clone(),
            risk_gate: Arc::new(PortfolioRiskGate::new(Arc::new(RwLock::new(
                RiskLimits::default(),
            )))),
            sink: Arc::new(JsonlCausalLog::new(dir.path())),
            clock: clock.clone(),
        };
        let engine =
            GovernanceEngine::with_defaults(GovernanceConfig::default(), deps).expect("engine");
        engine
            .seed_parameters(&[(threshold(), param())])
            .expect("seed");
        engine
    };
    let push = |now: i64| {
        outcomes.extend(GOOD.iter().enumerate().map(|(i, r)| OutcomeRecord {
            ts_ms: now - (25 - i as i64) * 60_000,
            entity: ema_long(),
            realized_return: *r,
            tags: Vec::new(),
        }));
    };

    push(clock.advance_mins(CYCLE_MINS));
    let first = build().run_cycle();
    assert!(first.actions.is_empty());

    // a fresh engine picks the promote streak up from disk
    let engine = build();
    push(clock.advance_mins(CYCLE_MINS));
    let second = engine.run_cycle();
    assert_eq!(second.cycle_seq, 2);
    assert_eq!(second.actions.len(), 1);
    let stored = engine.store().get_parameter(&threshold()).expect("load").expect("param");
    assert!(approx(stored.state.value, 0.12));
    assert_eq!(engine.history(10).expect("history").len(), 2);
}
