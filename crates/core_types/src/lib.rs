use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Tolerance used when checking float bounds after a step or a revert.
pub const VALUE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    pub scope: String,
    pub key: String,
}

impl EntityId {
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.key)
    }
}

impl FromStr for EntityId {
    type Err = GovernanceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((scope, key)) = raw.trim().split_once(':') else {
            return Err(GovernanceError::InvalidIdentifier(raw.to_string()));
        };
        let (scope, key) = (scope.trim(), key.trim());
        if scope.is_empty() || key.is_empty() {
            return Err(GovernanceError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self::new(scope, key))
    }
}

impl TryFrom<String> for EntityId {
    type Error = GovernanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.to_string()
    }
}

/// A named parameter governed on behalf of one entity. Textual form `scope:key/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParameterRef {
    pub entity: EntityId,
    pub name: String,
}

impl ParameterRef {
    pub fn new(entity: EntityId, name: impl Into<String>) -> Self {
        Self {
            entity,
            name: name.into(),
        }
    }
}

impl fmt::Display for ParameterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.name)
    }
}

impl FromStr for ParameterRef {
    type Err = GovernanceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((entity, name)) = raw.trim().rsplit_once('/') else {
            return Err(GovernanceError::InvalidIdentifier(raw.to_string()));
        };
        if name.trim().is_empty() {
            return Err(GovernanceError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self::new(entity.parse()?, name.trim()))
    }
}

impl TryFrom<String> for ParameterRef {
    type Error = GovernanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParameterRef> for String {
    fn from(value: ParameterRef) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    Paused,
    Retired,
}

impl EntityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Retired => "retired",
        }
    }
}

/// Which way a promotion moves a parameter. Rollback steps go the other way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromoteDirection {
    #[default]
    Increase,
    Decrease,
}

impl PromoteDirection {
    pub fn sign(self) -> f64 {
        match self {
            Self::Increase => 1.0,
            Self::Decrease => -1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterState {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Value at the last external reset; cumulative drift is measured against it.
    pub baseline: f64,
    pub max_cumulative_drift: f64,
    #[serde(default)]
    pub promote_direction: PromoteDirection,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl ParameterState {
    pub fn drift(&self) -> f64 {
        (self.value - self.baseline).abs()
    }

    pub fn within_invariants(&self) -> bool {
        self.value >= self.min - VALUE_EPSILON
            && self.value <= self.max + VALUE_EPSILON
            && self.drift() <= self.max_cumulative_drift + VALUE_EPSILON
    }

    pub fn validate(&self, name: &str) -> Result<(), GovernanceError> {
        let invalid = |reason: &str| GovernanceError::InvalidParameter {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let fields = [
            self.value,
            self.min,
            self.max,
            self.step,
            self.baseline,
            self.max_cumulative_drift,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite field"));
        }
        if self.min > self.max {
            return Err(invalid("min > max"));
        }
        if self.step <= 0.0 {
            return Err(invalid("step must be positive"));
        }
        if self.max_cumulative_drift < 0.0 {
            return Err(invalid("max_cumulative_drift must be non-negative"));
        }
        if self.baseline < self.min || self.baseline > self.max {
            return Err(invalid("baseline outside [min, max]"));
        }
        if !self.within_invariants() {
            return Err(invalid("value outside bounds or drift budget"));
        }
        Ok(())
    }

    /// Re-anchor the drift budget at the current value (external reset).
    pub fn reset_baseline(&mut self, now_ms: i64) {
        self.baseline = self.value;
        self.updated_at_ms = now_ms;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Short,
    Long,
}

impl WindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub ts_ms: i64,
    pub entity: EntityId,
    pub realized_return: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Immutable per-cycle aggregate. `sample_count == 0` means insufficient evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricWindow {
    pub entity: EntityId,
    pub kind: WindowKind,
    pub window_mins: u64,
    pub avg_return: f64,
    pub sample_count: u64,
    #[serde(default)]
    pub win_count: u64,
    pub as_of_ms: i64,
}

impl MetricWindow {
    pub fn empty(entity: EntityId, kind: WindowKind, window_mins: u64, as_of_ms: i64) -> Self {
        Self {
            entity,
            kind,
            window_mins,
            avg_return: 0.0,
            sample_count: 0,
            win_count: 0,
            as_of_ms,
        }
    }

    pub fn has_evidence(&self) -> bool {
        self.sample_count > 0
    }

    pub fn win_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.win_count as f64 / self.sample_count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterventionEvent {
    pub id: String,
    pub kind: String,
    pub affected_entities: Vec<EntityId>,
    #[serde(default)]
    pub delta: f64,
    pub ts_ms: i64,
}

impl InterventionEvent {
    pub fn touches(&self, entity: &EntityId) -> bool {
        self.affected_entities.iter().any(|e| e == entity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionRecord {
    pub entity: EntityId,
    pub uplift: f64,
    pub expectancy_score: f64,
    pub short: MetricWindow,
    pub long: MetricWindow,
    pub linked_intervention: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateDecision {
    pub entity: EntityId,
    pub profit_gate_pass: bool,
    pub rollback_gate_pass: bool,
    pub risk_gate_pass: bool,
    pub insufficient_evidence: bool,
    pub reasons: Vec<String>,
}

impl GateDecision {
    pub fn promote_eligible(&self) -> bool {
        self.profit_gate_pass && self.risk_gate_pass
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreakCounter {
    pub promote_count: u32,
    pub rollback_count: u32,
    pub no_evidence_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Promote,
    Rollback,
    Pause,
    Resume,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Rollback => "rollback",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: String,
    pub cycle_seq: u64,
    pub entity: EntityId,
    /// `None` for entity-level actions (pause/resume).
    pub parameter: Option<String>,
    pub kind: ActionKind,
    pub from_value: f64,
    pub to_value: f64,
    pub reason: String,
    pub streak_at_apply: u32,
    /// Id of the action this one exactly undoes.
    #[serde(default)]
    pub reverts: Option<String>,
    pub ts_ms: i64,
}

impl Action {
    pub fn delta(&self) -> f64 {
        self.to_value - self.from_value
    }

    pub fn parameter_ref(&self) -> Option<ParameterRef> {
        self.parameter
            .as_ref()
            .map(|name| ParameterRef::new(self.entity.clone(), name.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenPromotion {
    pub action: Action,
    pub applied_cycle: u64,
}

/// Persisted control state for one governed entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EntityLedger {
    pub status: EntityStatus,
    pub streak: StreakCounter,
    #[serde(default)]
    pub open_promotions: Vec<OpenPromotion>,
    #[serde(default)]
    pub risk_vetoed_last_cycle: bool,
    #[serde(default)]
    pub first_seen_ms: i64,
    #[serde(default)]
    pub last_evaluated_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationPair {
    pub a: EntityId,
    pub b: EntityId,
    pub correlation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskSnapshot {
    pub total_exposure: f64,
    #[serde(default)]
    pub per_entity_exposure: BTreeMap<EntityId, f64>,
    #[serde(default)]
    pub max_leverage: f64,
    /// Worst drawdown observed over the risk window, as a positive fraction.
    #[serde(default)]
    pub max_drawdown_window: f64,
    #[serde(default)]
    pub volatility: BTreeMap<EntityId, f64>,
    #[serde(default)]
    pub pairwise_correlation: Vec<CorrelationPair>,
    #[serde(default)]
    pub as_of_ms: i64,
}

impl RiskSnapshot {
    pub fn exposure_of(&self, entity: &EntityId) -> f64 {
        self.per_entity_exposure
            .get(entity)
            .copied()
            .unwrap_or(0.0)
            .abs()
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Ok,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resilience {
    #[default]
    Active,
    Idle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profitability {
    Positive,
    #[default]
    Flat,
    Negative,
}

/// The fixed field set compared between the primary and the twin judgment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HealthJudgment {
    pub severity: Severity,
    pub resilience: Resilience,
    pub profitability: Profitability,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBridgeMode {
    #[default]
    Primary,
    Twin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwinState {
    pub primary_active: bool,
    pub execution_bridge_mode: ExecutionBridgeMode,
    pub last_validation_ts_ms: i64,
    pub failover_triggered: bool,
    pub divergent_fields: Vec<String>,
}

impl Default for TwinState {
    fn default() -> Self {
        Self {
            primary_active: true,
            execution_bridge_mode: ExecutionBridgeMode::Primary,
            last_validation_ts_ms: 0,
            failover_triggered: false,
            divergent_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CausalEdge {
    pub ts_ms: i64,
    pub cycle_seq: u64,
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl CausalEdge {
    pub fn new(
        ts_ms: i64,
        cycle_seq: u64,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            ts_ms,
            cycle_seq,
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityError {
    pub entity: EntityId,
    pub error: String,
}

/// The only surface external orchestration should depend on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CycleSummary {
    pub cycle_seq: u64,
    pub ts_ms: i64,
    pub severity: Severity,
    pub health: HealthJudgment,
    pub actions: Vec<Action>,
    pub rollbacks: Vec<Action>,
    pub gate_decisions: Vec<GateDecision>,
    pub twin: TwinState,
    pub promotions_blocked: bool,
    pub fail_closed: bool,
    pub cycle_aborted: bool,
    #[serde(default)]
    pub abort_reason: Option<String>,
    #[serde(default)]
    pub entity_errors: Vec<EntityError>,
    #[serde(default)]
    pub suppressed_promotions: Vec<Action>,
    #[serde(default)]
    pub store_conflicts: Vec<String>,
}

impl CycleSummary {
    pub fn aborted(cycle_seq: u64, ts_ms: i64, reason: impl Into<String>, twin: TwinState) -> Self {
        Self {
            cycle_seq,
            ts_ms,
            severity: Severity::Critical,
            health: HealthJudgment {
                severity: Severity::Critical,
                ..HealthJudgment::default()
            },
            twin,
            promotions_blocked: true,
            cycle_aborted: true,
            abort_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn applied_count(&self) -> usize {
        self.actions.len() + self.rollbacks.len()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GovernanceError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("feed unavailable: {0}")]
    FeedUnavailable(String),
    #[error("cycle budget exceeded after {elapsed_ms}ms (budget {budget_ms}ms)")]
    BudgetExceeded { elapsed_ms: u64, budget_ms: u64 },
}

/// Ordered, append-only outcome stream supplied by execution logging.
pub trait OutcomeFeed: Send + Sync {
    /// Records with `from_ms < ts_ms <= to_ms`, oldest first, at most the newest `max_records`.
    fn outcomes_between(&self, from_ms: i64, to_ms: i64, max_records: usize)
        -> Result<Vec<OutcomeRecord>>;
}

pub trait InterventionFeed: Send + Sync {
    fn interventions_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<InterventionEvent>>;
}

pub trait RiskSource: Send + Sync {
    fn snapshot(&self) -> Result<RiskSnapshot>;
}

/// Append-only audit sink. Only the twin comparator reads back, and only the latest summary.
pub trait CausalSink: Send + Sync {
    fn append_edges(&self, edges: &[CausalEdge]) -> Result<()>;
    fn append_summary(&self, summary: &CycleSummary) -> Result<()>;
    fn latest_summary(&self) -> Result<Option<CycleSummary>>;
    fn history(&self, limit: usize) -> Result<Vec<CycleSummary>>;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
