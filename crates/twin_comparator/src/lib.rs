use core_types::{
    ExecutionBridgeMode, HealthJudgment, Profitability, Resilience, Severity, TwinState,
    VALUE_EPSILON,
};
use serde::{Deserialize, Serialize};

/// Primary judgment inputs, taken from the shared cycle snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthInputs {
    pub risk_severity: Severity,
    pub entities_evaluated: usize,
    pub entities_with_evidence: usize,
    /// Sample-weighted short-window return across entities with evidence.
    pub weighted_short_return: f64,
}

pub fn judge_health(inputs: &HealthInputs) -> HealthJudgment {
    let severity = inputs.risk_severity;
    let resilience = if inputs.entities_with_evidence > 0 {
        Resilience::Active
    } else {
        Resilience::Idle
    };
    let profitability = if inputs.entities_with_evidence == 0 {
        Profitability::Flat
    } else if inputs.weighted_short_return > VALUE_EPSILON {
        Profitability::Positive
    } else if inputs.weighted_short_return < -VALUE_EPSILON {
        Profitability::Negative
    } else {
        Profitability::Flat
    };
    HealthJudgment {
        severity,
        resilience,
        profitability,
    }
}

pub fn divergent_fields(primary: &HealthJudgment, twin: &HealthJudgment) -> Vec<String> {
    let mut out = Vec::new();
    if primary.severity != twin.severity {
        out.push("severity".to_string());
    }
    if primary.resilience != twin.resilience {
        out.push("resilience".to_string());
    }
    if primary.profitability != twin.profitability {
        out.push("profitability".to_string());
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwinVerdict {
    /// False when there was no prior judgment to compare against.
    pub compared: bool,
    pub divergent_fields: Vec<String>,
    pub newly_latched: bool,
    pub cleared: bool,
    pub promotions_blocked: bool,
    pub state: TwinState,
}

/// Owns the `TwinState` for one cycle. The twin judgment is the previous cycle's health.
#[derive(Debug, Clone, Default)]
pub struct TwinComparator {
    state: TwinState,
}

impl TwinComparator {
    pub fn new(state: TwinState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &TwinState {
        &self.state
    }

    pub fn into_state(self) -> TwinState {
        self.state
    }

    pub fn is_latched(&self) -> bool {
        self.state.failover_triggered
    }

    pub fn compare(
        &mut self,
        primary: &HealthJudgment,
        twin: Option<&HealthJudgment>,
        now_ms: i64,
    ) -> TwinVerdict {
        let Some(twin) = twin else {
            return TwinVerdict {
                compared: false,
                divergent_fields: Vec::new(),
                newly_latched: false,
                cleared: false,
                promotions_blocked: self.state.failover_triggered,
                state: self.state.clone(),
            };
        };

        let divergent = divergent_fields(primary, twin);
        let was_latched = self.state.failover_triggered;
        self.state.last_validation_ts_ms = now_ms;
        self.state.divergent_fields = divergent.clone();

        let critical_divergence =
            divergent.iter().any(|f| f == "severity") && primary.severity == Severity::Critical;
        let clean = divergent.is_empty() && primary.severity != Severity::Critical;

        if critical_divergence {
            self.latch();
        } else if clean && was_latched {
            self.release();
        }

        let newly_latched = !was_latched && self.state.failover_triggered;
        let cleared = was_latched && !self.state.failover_triggered;
        if newly_latched {
            tracing::warn!(
                divergent = ?divergent,
                primary = primary.severity.as_str(),
                twin = twin.severity.as_str(),
                "twin divergence on critical severity; failover latched"
            );
        } else if cleared {
            tracing::info!("clean twin comparison; failover released");
        }

        TwinVerdict {
            compared: true,
            divergent_fields: divergent,
            newly_latched,
            cleared,
            promotions_blocked: self.state.failover_triggered,
            state: self.state.clone(),
        }
    }

    fn latch(&mut self) {
        self.state.failover_triggered = true;
        self.state.primary_active = false;
        self.state.execution_bridge_mode = ExecutionBridgeMode::Twin;
    }

    fn release(&mut self) {
        self.state.failover_triggered = false;
        self.state.primary_active = true;
        self.state.execution_bridge_mode = ExecutionBridgeMode::Primary;
    }
}
