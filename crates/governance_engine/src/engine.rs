use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use attribution::{AttributionEngine, ExpectancyModel, GOVERNANCE_ACTION_KIND};
use causal_log::EdgeBuilder;
use config_store::{update_with_retry, ConfigStore, GovernanceDocument, StoreError, StoredParameter};
use core_types::{
    Action, ActionKind, CausalSink, CycleSummary, EntityError, EntityId, EntityLedger,
    EntityStatus, GateDecision, GovernanceError, HealthJudgment, InterventionEvent,
    InterventionFeed, OpenPromotion, OutcomeFeed, ParameterRef, ParameterState, Profitability,
    Resilience, RiskSnapshot, RiskSource, Severity, TwinState,
};
use infra_clock::{Clock, CycleBudget, SharedClock};
use metric_store::{MetricSnapshot, MetricStore};
use risk_engine::{RiskAssessment, RiskGate};
use serde::Serialize;
use twin_comparator::{judge_health, HealthInputs, TwinComparator, TwinVerdict};

use crate::commands::{CommandQueue, OperatorCommand, OperatorOp};
use crate::config::{ConfigError, GovernanceConfig};
use crate::executor::{ActionContext, ActionExecutor, ExecOutcome};
use crate::gate::{self, ProfitGate, ThresholdProfitGate};
use crate::rollback::{RollbackManager, RollbackTrigger};
use crate::streak::{self, StreakOutcome};

/// Pushes committed values to the governed system. Runs after the store commit.
pub trait ActionApplier: Send + Sync {
    fn apply(&self, actions: &[Action], doc: &GovernanceDocument) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplier;

impl ActionApplier for NoopApplier {
    fn apply(&self, _actions: &[Action], _doc: &GovernanceDocument) -> Result<()> {
        Ok(())
    }
}

pub struct EngineDeps {
    pub store: Arc<dyn ConfigStore>,
    pub outcomes: Arc<dyn OutcomeFeed>,
    pub interventions: Arc<dyn InterventionFeed>,
    pub risk_source: Arc<dyn RiskSource>,
    pub risk_gate: Arc<dyn RiskGate>,
    pub sink: Arc<dyn CausalSink>,
    pub clock: SharedClock,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub cycle_seq: u64,
    pub store_version: u64,
    pub twin: TwinState,
    pub entities: BTreeMap<EntityId, EntityLedger>,
    pub parameters: BTreeMap<ParameterRef, StoredParameter>,
    pub pending_commands: Vec<OperatorCommand>,
}

struct CycleInputs {
    metrics: MetricSnapshot,
    interventions: Vec<InterventionEvent>,
    risk: RiskSnapshot,
}

struct CycleCtx<'a> {
    action: ActionContext,
    doc: &'a GovernanceDocument,
    metrics: &'a MetricSnapshot,
    risk: &'a RiskAssessment,
    interventions: &'a [InterventionEvent],
    /// Entities an operator command touched this cycle; their status is left alone.
    operator_touched: &'a BTreeSet<EntityId>,
}

struct Proposal {
    action: Action,
    /// Revision the action was planned against; `None` for entity-level actions.
    expected_revision: Option<u64>,
}

struct EntityEval {
    entity: EntityId,
    attribution: core_types::AttributionRecord,
    decision: GateDecision,
    outcome: StreakOutcome,
    ledger: EntityLedger,
    proposals: Vec<Proposal>,
    noops: Vec<String>,
}

pub struct GovernanceEngine<P: ProfitGate = ThresholdProfitGate> {
    cfg: GovernanceConfig,
    profit_gate: P,
    metric_store: MetricStore,
    attribution: AttributionEngine,
    executor: ActionExecutor,
    rollback: RollbackManager,
    store: Arc<dyn ConfigStore>,
    interventions: Arc<dyn InterventionFeed>,
    risk_source: Arc<dyn RiskSource>,
    risk_gate: Arc<dyn RiskGate>,
    sink: Arc<dyn CausalSink>,
    clock: SharedClock,
    applier: Box<dyn ActionApplier>,
    commands: Arc<CommandQueue>,
}

impl GovernanceEngine<ThresholdProfitGate> {
    pub fn with_defaults(cfg: GovernanceConfig, deps: EngineDeps) -> Result<Self, ConfigError> {
        Self::new(cfg, deps, ThresholdProfitGate)
    }
}

impl<P: ProfitGate> GovernanceEngine<P> {
    pub fn new(cfg: GovernanceConfig, deps: EngineDeps, profit_gate: P) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            metric_store: MetricStore::new(deps.outcomes, cfg.windows.clone()),
            attribution: AttributionEngine::new(&cfg.attribution)
                .with_own_action_lookback(own_action_lookback_ms(&cfg)),
            executor: ActionExecutor,
            rollback: RollbackManager::new(cfg.rollback.watch_cycles),
            profit_gate,
            store: deps.store,
            interventions: deps.interventions,
            risk_source: deps.risk_source,
            risk_gate: deps.risk_gate,
            sink: deps.sink,
            clock: deps.clock,
            applier: Box::new(NoopApplier),
            commands: Arc::new(CommandQueue::default()),
            cfg,
        })
    }

    pub fn with_applier(mut self, applier: Box<dyn ActionApplier>) -> Self {
        self.applier = applier;
        self
    }

    pub fn with_expectancy_model(mut self, model: Box<dyn ExpectancyModel>) -> Self {
        self.attribution = AttributionEngine::with_model(&self.cfg.attribution, model)
            .with_own_action_lookback(own_action_lookback_ms(&self.cfg));
        self
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.cfg
    }

    pub fn commands(&self) -> Arc<CommandQueue> {
        self.commands.clone()
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        self.store.clone()
    }

    pub fn sink(&self) -> Arc<dyn CausalSink> {
        self.sink.clone()
    }

    /// Register declared parameters that the store does not know yet.
    pub fn seed_parameters(
        &self,
        params: &[(ParameterRef, ParameterState)],
    ) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let mut inserted = 0;
        update_with_retry(self.store.as_ref(), self.cfg.cycle.max_commit_attempts, |doc| {
            inserted = 0;
            for (pref, state) in params {
                if doc.register_parameter(pref.clone(), state.clone(), now)? {
                    inserted += 1;
                }
            }
            Ok(())
        })?;
        if inserted > 0 {
            tracing::info!(inserted, "seeded governed parameters");
        }
        Ok(inserted)
    }

    pub fn status(&self) -> Result<EngineStatus, StoreError> {
        let doc = self.store.load()?;
        Ok(EngineStatus {
            cycle_seq: doc.cycle_seq,
            store_version: doc.version,
            twin: doc.twin,
            entities: doc.entities,
            parameters: doc.parameters,
            pending_commands: self.commands.pending(),
        })
    }

    pub fn history(&self, limit: usize) -> Result<Vec<CycleSummary>> {
        self.sink.history(limit)
    }

    pub fn run_cycle(&self) -> CycleSummary {
        let now = self.clock.now_ms();
        metrics::counter!(observability::CYCLES).increment(1);

        let latest = match self.sink.latest_summary() {
            Ok(latest) => latest,
            Err(err) => {
                tracing::warn!(error = %err, "could not read previous cycle summary; twin comparison skipped");
                None
            }
        };

        let doc = match self.store.load() {
            Ok(doc) => doc,
            Err(err) => {
                let seq = latest.as_ref().map_or(1, |s| s.cycle_seq + 1);
                return self.abort(seq, now, format!("config store: {err}"), TwinState::default());
            }
        };
        // fail-closed and aborted cycles never persist their number; the log remembers it
        let seq = doc
            .cycle_seq
            .max(latest.as_ref().map_or(0, |s| s.cycle_seq))
            + 1;

        let inputs = match self.acquire(now) {
            Ok(inputs) => inputs,
            Err(err) => return self.fail_closed(&doc, seq, now, format!("{err:#}")),
        };

        let summary = self.evaluate_and_commit(doc, seq, now, inputs, latest.as_ref());
        self.record(&summary);
        summary
    }

    fn acquire(&self, now: i64) -> Result<CycleInputs> {
        let budget = CycleBudget::start(Duration::from_millis(self.cfg.cycle.cycle_budget_ms));
        let check = |stage: &str| -> Result<()> {
            if budget.exceeded() {
                let err = GovernanceError::BudgetExceeded {
                    elapsed_ms: budget.elapsed().as_millis() as u64,
                    budget_ms: budget.budget().as_millis() as u64,
                };
                return Err(err).with_context(|| format!("after {stage}"));
            }
            Ok(())
        };

        let metrics = self
            .metric_store
            .snapshot(now)
            .map_err(|e| GovernanceError::FeedUnavailable(format!("outcomes: {e:#}")))?;
        check("metric snapshot")?;
        let interventions = self
            .interventions
            .interventions_between(now.saturating_sub(self.attribution.lookback_ms()), now)
            .map_err(|e| GovernanceError::FeedUnavailable(format!("interventions: {e:#}")))?;
        check("intervention read")?;
        let risk = self
            .risk_source
            .snapshot()
            .map_err(|e| GovernanceError::FeedUnavailable(format!("risk snapshot: {e:#}")))?;
        check("risk snapshot")?;
        Ok(CycleInputs {
            metrics,
            interventions,
            risk,
        })
    }

    fn evaluate_and_commit(
        &self,
        doc: GovernanceDocument,
        seq: u64,
        now: i64,
        inputs: CycleInputs,
        latest: Option<&CycleSummary>,
    ) -> CycleSummary {
        let action_ctx = ActionContext {
            cycle_seq: seq,
            now_ms: now,
        };
        let mut edges = EdgeBuilder::new(now, seq);

        // Ledgers for every known or newly seen entity.
        let mut ledgers = doc.entities.clone();
        let discovered = inputs
            .metrics
            .entities()
            .cloned()
            .chain(doc.parameters.keys().map(|p| p.entity.clone()))
            .collect::<BTreeSet<_>>();
        for entity in discovered {
            ledgers.entry(entity).or_insert_with(|| EntityLedger {
                first_seen_ms: now,
                ..EntityLedger::default()
            });
        }

        let mut operator_actions = Vec::new();
        let mut operator_touched = BTreeSet::new();
        let drained = self.commands.drain();
        for cmd in &drained {
            operator_touched.insert(cmd.entity.clone());
            if let Some(action) = self.apply_operator(cmd, &mut ledgers, action_ctx, &mut edges) {
                operator_actions.push(action);
            }
        }

        let entities = ledgers.keys().cloned().collect::<Vec<_>>();
        let assessment = self.risk_gate.assess(&inputs.risk, &entities);
        let interventions = merge_interventions(inputs.interventions, &ledgers, latest);
        let health = judge_health(&health_inputs(&inputs.metrics, &ledgers, assessment.severity));
        let prior = prior_health(latest);

        let cx = CycleCtx {
            action: action_ctx,
            doc: &doc,
            metrics: &inputs.metrics,
            risk: &assessment,
            interventions: &interventions,
            operator_touched: &operator_touched,
        };

        let mut twin = TwinComparator::new(doc.twin.clone());
        let fallback_twin = doc.twin.clone();
        let (verdict, evals) = std::thread::scope(|scope| {
            let handle = scope.spawn(move || twin.compare(&health, prior.as_ref(), now));
            let evals = ledgers
                .iter()
                .filter(|(_, ledger)| ledger.status != EntityStatus::Retired)
                .map(|(entity, ledger)| (entity.clone(), self.evaluate_entity(&cx, entity, ledger)))
                .collect::<Vec<_>>();
            let verdict = handle.join().unwrap_or_else(|_| {
                tracing::error!("twin comparison panicked; blocking promotions this cycle");
                TwinVerdict {
                    compared: false,
                    divergent_fields: Vec::new(),
                    newly_latched: false,
                    cleared: false,
                    promotions_blocked: true,
                    state: fallback_twin,
                }
            });
            (verdict, evals)
        });

        // Barrier: nothing is flushed before the twin verdict is known.
        let mut summary = CycleSummary {
            cycle_seq: seq,
            ts_ms: now,
            severity: health.severity,
            health,
            twin: verdict.state.clone(),
            promotions_blocked: verdict.promotions_blocked,
            ..CycleSummary::default()
        };
        let mut proposals = operator_actions
            .into_iter()
            .map(|action| Proposal {
                action,
                expected_revision: None,
            })
            .collect::<Vec<_>>();
        let mut committed_ledgers = operator_touched
            .iter()
            .filter_map(|e| ledgers.get(e).map(|l| (e.clone(), l.clone())))
            .collect::<BTreeMap<_, _>>();

        for (entity, result) in evals {
            match result {
                Ok(eval) => {
                    edges.attribution(&eval.attribution);
                    edges.gate(&eval.decision);
                    edges.push(eval.entity.to_string(), "streak_outcome", eval.outcome.as_str());
                    for reason in &eval.noops {
                        edges.push(eval.entity.to_string(), "action_noop", reason);
                    }
                    for proposal in eval.proposals {
                        if proposal.action.kind == ActionKind::Promote && verdict.promotions_blocked {
                            edges.suppressed(&proposal.action);
                            summary.suppressed_promotions.push(proposal.action);
                        } else {
                            proposals.push(proposal);
                        }
                    }
                    summary.gate_decisions.push(eval.decision);
                    committed_ledgers.insert(eval.entity, eval.ledger);
                }
                Err(err) => {
                    tracing::warn!(entity = %entity, error = %format!("{err:#}"), "entity evaluation failed");
                    edges.push(entity.to_string(), "evaluation_error", format!("{err:#}"));
                    summary.entity_errors.push(EntityError {
                        entity,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        let mut applied = Vec::<Action>::new();
        let mut conflicts = Vec::<String>::new();
        let mut commit_errors = Vec::<EntityError>::new();
        let twin_state = verdict.state.clone();
        let commit = update_with_retry(
            self.store.as_ref(),
            self.cfg.cycle.max_commit_attempts,
            |fresh| {
                applied.clear();
                conflicts.clear();
                commit_errors.clear();
                fresh.cycle_seq = seq;
                fresh.twin = twin_state.clone();
                fresh.updated_at_ms = now;
                for (entity, ledger) in &committed_ledgers {
                    let slot = fresh.ledger_mut(entity, now);
                    slot.status = ledger.status;
                    slot.streak = ledger.streak;
                    slot.risk_vetoed_last_cycle = ledger.risk_vetoed_last_cycle;
                    slot.last_evaluated_ms = ledger.last_evaluated_ms;
                }
                for proposal in &proposals {
                    let action = &proposal.action;
                    if let Some(pref) = action.parameter_ref() {
                        let Some(stored) = fresh.parameters.get_mut(&pref) else {
                            conflicts.push(format!("{pref}: no longer registered"));
                            continue;
                        };
                        if Some(stored.revision) != proposal.expected_revision {
                            conflicts.push(format!(
                                "{pref}: revision {} != planned {}",
                                stored.revision,
                                proposal.expected_revision.unwrap_or_default()
                            ));
                            continue;
                        }
                        if let Err(err) = self.executor.commit(stored, action, now) {
                            commit_errors.push(EntityError {
                                entity: action.entity.clone(),
                                error: err.to_string(),
                            });
                            continue;
                        }
                        let slot = fresh.ledger_mut(&action.entity, now);
                        match (action.kind, action.reverts.as_deref()) {
                            (ActionKind::Promote, _) => slot.open_promotions.push(OpenPromotion {
                                action: action.clone(),
                                applied_cycle: seq,
                            }),
                            (ActionKind::Rollback, Some(reverted)) => {
                                slot.open_promotions.retain(|p| p.action.id != reverted)
                            }
                            _ => {}
                        }
                    }
                    applied.push(action.clone());
                }
                for ledger in fresh.entities.values_mut() {
                    self.rollback.expire(ledger, seq);
                }
                Ok(())
            },
        );

        let committed = match commit {
            Ok((committed, attempts)) => {
                if attempts > 1 {
                    tracing::info!(attempts, "cycle committed after store conflicts");
                }
                committed
            }
            Err(err) => {
                tracing::error!(cycle_seq = seq, error = %err, "cycle commit failed; nothing applied");
                metrics::counter!(observability::CYCLE_ABORTED).increment(1);
                edges.push("cycle", "commit_failed", err.to_string());
                if !drained.is_empty() {
                    tracing::warn!(requeued = drained.len(), "operator commands returned to the queue");
                    self.commands.requeue_front(drained);
                }
                summary.cycle_aborted = true;
                summary.abort_reason = Some(format!("commit: {err}"));
                summary.promotions_blocked = true;
                summary.suppressed_promotions.clear();
                summary.twin = doc.twin.clone();
                self.append_edges(edges.finish());
                return summary;
            }
        };

        for conflict in &conflicts {
            edges.push("store", "conflict_dropped", conflict);
        }
        for err in &commit_errors {
            edges.push(err.entity.to_string(), "commit_error", &err.error);
        }
        for action in &applied {
            edges.action(action);
        }
        edges.twin(&committed.twin);

        if !applied.is_empty() {
            if let Err(err) = self.applier.apply(&applied, &committed) {
                tracing::warn!(error = %format!("{err:#}"), "action applier failed; state is committed");
            }
        }

        metrics::counter!(observability::STORE_CONFLICTS).increment(conflicts.len() as u64);
        metrics::counter!(observability::ENTITY_ERRORS)
            .increment((summary.entity_errors.len() + commit_errors.len()) as u64);
        metrics::counter!(observability::PROMOTIONS_SUPPRESSED)
            .increment(summary.suppressed_promotions.len() as u64);
        if verdict.newly_latched {
            metrics::counter!(observability::TWIN_FAILOVER).increment(1);
        }
        metrics::gauge!(observability::ENTITIES_GOVERNED).set(committed.entities.len() as f64);

        let (rollbacks, actions): (Vec<Action>, Vec<Action>) = applied
            .into_iter()
            .partition(|a| a.kind == ActionKind::Rollback);
        metrics::counter!(observability::ACTIONS_APPLIED)
            .increment((actions.len() + rollbacks.len()) as u64);
        metrics::counter!(observability::ROLLBACKS).increment(rollbacks.len() as u64);

        summary.actions = actions;
        summary.rollbacks = rollbacks;
        summary.store_conflicts = conflicts;
        summary.entity_errors.extend(commit_errors);
        summary.twin = committed.twin;
        self.append_edges(edges.finish());

        tracing::info!(
            cycle_seq = seq,
            severity = summary.severity.as_str(),
            actions = summary.actions.len(),
            rollbacks = summary.rollbacks.len(),
            suppressed = summary.suppressed_promotions.len(),
            failover = summary.twin.failover_triggered,
            "governance cycle complete"
        );
        summary
    }

    fn evaluate_entity(
        &self,
        cx: &CycleCtx<'_>,
        entity: &EntityId,
        ledger: &EntityLedger,
    ) -> Result<EntityEval> {
        let windows = cx.metrics.windows_for(entity);
        let attribution = self.attribution.attribute(
            &windows.short,
            &windows.long,
            cx.interventions,
            cx.action.now_ms,
        );
        let thresholds = self.cfg.gates.for_scope(&entity.scope);
        let verdict = self
            .profit_gate
            .evaluate(&attribution, thresholds)
            .with_context(|| format!("profit gate for {entity}"))?;
        let decision = gate::decide(entity, verdict, cx.risk);
        let outcome = streak::classify(&decision);

        let mut next = ledger.clone();
        next.streak = streak::advance(ledger.streak, outcome);
        next.last_evaluated_ms = cx.action.now_ms;
        let vetoed = cx.risk.is_vetoed(entity);
        let fresh_breach = vetoed && !ledger.risk_vetoed_last_cycle;
        next.risk_vetoed_last_cycle = vetoed;

        let mut proposals = Vec::new();
        let mut noops = Vec::new();
        let mut moved = BTreeSet::<String>::new();
        let streaks = &self.cfg.streaks;

        if fresh_breach {
            for promotion in self.rollback.revert_targets(
                ledger,
                cx.action.cycle_seq,
                RollbackTrigger::FreshRiskBreach,
                None,
            ) {
                self.plan_revert(
                    cx,
                    &promotion.action,
                    RollbackTrigger::FreshRiskBreach,
                    0,
                    &mut proposals,
                    &mut noops,
                    &mut moved,
                );
            }
        }

        if streaks.rollback_fired(&next.streak) {
            let streak_at = next.streak.rollback_count;
            next.streak.rollback_count = 0;
            let targets = self.rollback.revert_targets(
                ledger,
                cx.action.cycle_seq,
                RollbackTrigger::SustainedDegradation,
                attribution.linked_intervention.as_deref(),
            );
            if targets.is_empty() {
                for (pref, stored) in cx.doc.parameters_of(entity) {
                    if moved.contains(&pref.name) {
                        continue;
                    }
                    let outcome = self.executor.step(
                        cx.action,
                        pref,
                        &stored.state,
                        ActionKind::Rollback,
                        "sustained_degradation_step",
                        streak_at,
                    )?;
                    push_outcome(outcome, stored.revision, &mut proposals, &mut noops, &mut moved);
                }
            } else {
                for promotion in targets {
                    if promotion
                        .action
                        .parameter
                        .as_ref()
                        .is_some_and(|name| moved.contains(name))
                    {
                        continue;
                    }
                    self.plan_revert(
                        cx,
                        &promotion.action,
                        RollbackTrigger::SustainedDegradation,
                        streak_at,
                        &mut proposals,
                        &mut noops,
                        &mut moved,
                    );
                }
            }
        }

        if ledger.status == EntityStatus::Active && streaks.promote_fired(&next.streak) {
            let streak_at = next.streak.promote_count;
            next.streak.promote_count = 0;
            for (pref, stored) in cx.doc.parameters_of(entity) {
                if moved.contains(&pref.name) {
                    continue;
                }
                let outcome = self.executor.step(
                    cx.action,
                    pref,
                    &stored.state,
                    ActionKind::Promote,
                    "promote_streak",
                    streak_at,
                )?;
                push_outcome(outcome, stored.revision, &mut proposals, &mut noops, &mut moved);
            }
        }

        let operator_owned = cx.operator_touched.contains(entity);
        if !operator_owned && ledger.status == EntityStatus::Active && streaks.pause_due(&next.streak) {
            let streak_at = next.streak.no_evidence_count;
            next.streak.no_evidence_count = 0;
            next.status = EntityStatus::Paused;
            proposals.push(Proposal {
                action: self.executor.status_change(
                    cx.action,
                    entity,
                    ActionKind::Pause,
                    "no_evidence_streak",
                    streak_at,
                ),
                expected_revision: None,
            });
        } else if !operator_owned
            && ledger.status == EntityStatus::Paused
            && windows.short.has_evidence()
            && attribution.uplift > 0.0
        {
            next.status = EntityStatus::Active;
            proposals.push(Proposal {
                action: self.executor.status_change(
                    cx.action,
                    entity,
                    ActionKind::Resume,
                    "evidence_with_positive_uplift",
                    0,
                ),
                expected_revision: None,
            });
        }

        Ok(EntityEval {
            entity: entity.clone(),
            attribution,
            decision,
            outcome,
            ledger: next,
            proposals,
            noops,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_revert(
        &self,
        cx: &CycleCtx<'_>,
        original: &Action,
        trigger: RollbackTrigger,
        streak_at: u32,
        proposals: &mut Vec<Proposal>,
        noops: &mut Vec<String>,
        moved: &mut BTreeSet<String>,
    ) {
        let Some(pref) = original.parameter_ref() else {
            return;
        };
        let Some(stored) = cx.doc.parameters.get(&pref) else {
            noops.push(format!("{pref} no longer registered; cannot revert {}", original.id));
            return;
        };
        let outcome = self
            .executor
            .revert(cx.action, original, &stored.state, trigger.as_str(), streak_at);
        push_outcome(outcome, stored.revision, proposals, noops, moved);
    }

    fn apply_operator(
        &self,
        cmd: &OperatorCommand,
        ledgers: &mut BTreeMap<EntityId, EntityLedger>,
        ctx: ActionContext,
        edges: &mut EdgeBuilder,
    ) -> Option<Action> {
        let ledger = ledgers.entry(cmd.entity.clone()).or_insert_with(|| EntityLedger {
            first_seen_ms: ctx.now_ms,
            ..EntityLedger::default()
        });
        let reason = if cmd.reason.trim().is_empty() {
            format!("operator_{}", cmd.op.as_str())
        } else {
            format!("operator: {}", cmd.reason.trim())
        };
        let (next, kind) = match (cmd.op, ledger.status) {
            (OperatorOp::Pause, EntityStatus::Active) => (EntityStatus::Paused, Some(ActionKind::Pause)),
            (OperatorOp::Resume, EntityStatus::Paused | EntityStatus::Retired) => {
                (EntityStatus::Active, Some(ActionKind::Resume))
            }
            (OperatorOp::Retire, status) if status != EntityStatus::Retired => (EntityStatus::Retired, None),
            (op, status) => {
                edges.push(
                    cmd.entity.to_string(),
                    "operator_noop",
                    format!("{} while {}", op.as_str(), status.as_str()),
                );
                return None;
            }
        };
        tracing::info!(entity = %cmd.entity, op = cmd.op.as_str(), from = ledger.status.as_str(), to = next.as_str(), "operator command applied");
        edges.push(cmd.entity.to_string(), "status", format!("{} {reason}", next.as_str()));
        ledger.status = next;
        kind.map(|kind| self.executor.status_change(ctx, &cmd.entity, kind, &reason, 0))
    }

    fn fail_closed(&self, doc: &GovernanceDocument, seq: u64, now: i64, reason: String) -> CycleSummary {
        tracing::warn!(cycle_seq = seq, reason = %reason, "cycle failed closed; no writes this cycle");
        metrics::counter!(observability::FAIL_CLOSED).increment(1);
        let mut edges = EdgeBuilder::new(now, seq);
        edges.push("cycle", "fail_closed", &reason);
        let known = doc
            .entities
            .iter()
            .filter(|(_, l)| l.status != EntityStatus::Retired)
            .map(|(e, _)| e.clone())
            .chain(doc.parameters.keys().map(|p| p.entity.clone()))
            .collect::<BTreeSet<_>>();
        let gate_decisions = known
            .into_iter()
            .map(|entity| {
                let decision = GateDecision {
                    entity,
                    profit_gate_pass: false,
                    rollback_gate_pass: false,
                    risk_gate_pass: false,
                    insufficient_evidence: true,
                    reasons: vec![format!("fail_closed: {reason}")],
                };
                edges.gate(&decision);
                decision
            })
            .collect();
        self.append_edges(edges.finish());
        let summary = CycleSummary {
            cycle_seq: seq,
            ts_ms: now,
            severity: Severity::Warn,
            health: HealthJudgment {
                severity: Severity::Warn,
                resilience: Resilience::Idle,
                profitability: Profitability::Flat,
            },
            gate_decisions,
            twin: doc.twin.clone(),
            promotions_blocked: true,
            fail_closed: true,
            abort_reason: Some(reason),
            ..CycleSummary::default()
        };
        self.record(&summary);
        summary
    }

    fn abort(&self, seq: u64, now: i64, reason: String, twin: TwinState) -> CycleSummary {
        tracing::error!(cycle_seq = seq, reason = %reason, "cycle aborted before evaluation");
        metrics::counter!(observability::CYCLE_ABORTED).increment(1);
        let summary = CycleSummary::aborted(seq, now, reason, twin);
        self.record(&summary);
        summary
    }

    fn append_edges(&self, edges: Vec<core_types::CausalEdge>) {
        if let Err(err) = self.sink.append_edges(&edges) {
            tracing::warn!(error = %format!("{err:#}"), "causal edge append failed");
        }
    }

    fn record(&self, summary: &CycleSummary) {
        if let Err(err) = self.sink.append_summary(summary) {
            tracing::warn!(error = %format!("{err:#}"), "cycle summary append failed");
        }
    }
}

fn push_outcome(
    outcome: ExecOutcome,
    revision: u64,
    proposals: &mut Vec<Proposal>,
    noops: &mut Vec<String>,
    moved: &mut BTreeSet<String>,
) {
    match outcome {
        ExecOutcome::Applied(action) => {
            if let Some(name) = &action.parameter {
                moved.insert(name.clone());
            }
            proposals.push(Proposal {
                action,
                expected_revision: Some(revision),
            });
        }
        ExecOutcome::NoOp(reason) => noops.push(reason),
    }
}

/// Health from the previous cycle, unless that cycle never evaluated anything.
fn prior_health(latest: Option<&CycleSummary>) -> Option<HealthJudgment> {
    latest
        .filter(|s| !s.cycle_aborted && !s.fail_closed)
        .map(|s| s.health)
}

fn health_inputs(
    metrics: &MetricSnapshot,
    ledgers: &BTreeMap<EntityId, EntityLedger>,
    risk_severity: Severity,
) -> HealthInputs {
    let mut inputs = HealthInputs {
        risk_severity,
        ..HealthInputs::default()
    };
    let mut weighted = 0.0;
    let mut samples = 0_u64;
    for (entity, ledger) in ledgers {
        if ledger.status == EntityStatus::Retired {
            continue;
        }
        inputs.entities_evaluated += 1;
        let short = metrics.windows_for(entity).short;
        if short.has_evidence() {
            inputs.entities_with_evidence += 1;
            weighted += short.avg_return * short.sample_count as f64;
            samples += short.sample_count;
        }
    }
    if samples > 0 {
        inputs.weighted_short_return = weighted / samples as f64;
    }
    inputs
}

/// External interventions plus the loop's own value-moving actions, deduplicated by id.
/// A promotion stays revertible for `watch_cycles`; one extra tick absorbs late cycles.
fn own_action_lookback_ms(cfg: &GovernanceConfig) -> i64 {
    let ticks = cfg.rollback.watch_cycles.saturating_add(1);
    let ms = ticks
        .saturating_mul(cfg.cycle.tick_secs)
        .saturating_mul(1_000);
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn merge_interventions(
    external: Vec<InterventionEvent>,
    ledgers: &BTreeMap<EntityId, EntityLedger>,
    latest: Option<&CycleSummary>,
) -> Vec<InterventionEvent> {
    let mut seen = external.iter().map(|e| e.id.clone()).collect::<BTreeSet<_>>();
    let mut out = external;
    let own = ledgers
        .values()
        .flat_map(|l| l.open_promotions.iter().map(|p| &p.action))
        .chain(
            latest
                .into_iter()
                .flat_map(|s| s.actions.iter().chain(s.rollbacks.iter())),
        )
        .filter(|a| a.parameter.is_some());
    for action in own {
        if seen.insert(action.id.clone()) {
            out.push(InterventionEvent {
                id: action.id.clone(),
                kind: GOVERNANCE_ACTION_KIND.to_string(),
                affected_entities: vec![action.entity.clone()],
                delta: action.delta(),
                ts_ms: action.ts_ms,
            });
        }
    }
    out
}
