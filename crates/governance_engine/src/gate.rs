use anyhow::Result;
use core_types::{AttributionRecord, EntityId, GateDecision};
use risk_engine::RiskAssessment;

use crate::config::GateThresholds;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfitVerdict {
    pub promote: bool,
    pub rollback: bool,
    pub insufficient_evidence: bool,
    pub reasons: Vec<String>,
}

pub trait ProfitGate: Send + Sync {
    fn evaluate(&self, rec: &AttributionRecord, thresholds: &GateThresholds) -> Result<ProfitVerdict>;
}

/// Band check on short-window return and expectancy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdProfitGate;

impl ProfitGate for ThresholdProfitGate {
    fn evaluate(&self, rec: &AttributionRecord, t: &GateThresholds) -> Result<ProfitVerdict> {
        let short = &rec.short;
        if short.sample_count < t.min_samples.max(1) {
            return Ok(ProfitVerdict {
                insufficient_evidence: true,
                reasons: vec![format!(
                    "insufficient_evidence samples={} min={}",
                    short.sample_count,
                    t.min_samples.max(1)
                )],
                ..ProfitVerdict::default()
            });
        }

        let avg = short.avg_return;
        let expectancy = rec.expectancy_score;
        let promote = avg >= t.profit_floor && expectancy >= t.promote_threshold;
        let rollback = avg <= t.loss_ceiling && expectancy <= t.rollback_threshold;
        let mut reasons = Vec::new();
        if promote {
            reasons.push(format!(
                "profit_pass avg={avg:.6}>={:.6} expectancy={expectancy:.4}>={:.4}",
                t.profit_floor, t.promote_threshold
            ));
        } else if rollback {
            reasons.push(format!(
                "profit_degraded avg={avg:.6}<={:.6} expectancy={expectancy:.4}<={:.4}",
                t.loss_ceiling, t.rollback_threshold
            ));
        } else {
            reasons.push(format!("hold avg={avg:.6} expectancy={expectancy:.4}"));
        }
        Ok(ProfitVerdict {
            promote,
            rollback,
            insufficient_evidence: false,
            reasons,
        })
    }
}

/// Combine the profit verdict with the cycle's risk assessment. A risk veto never
/// depends on the profit result.
pub fn decide(entity: &EntityId, verdict: ProfitVerdict, risk: &RiskAssessment) -> GateDecision {
    let vetoed = risk.is_vetoed(entity);
    let mut reasons = verdict.reasons;
    if vetoed {
        reasons.extend(risk.veto_reasons(entity));
    }
    GateDecision {
        entity: entity.clone(),
        profit_gate_pass: verdict.promote,
        rollback_gate_pass: verdict.rollback,
        risk_gate_pass: !vetoed,
        insufficient_evidence: verdict.insufficient_evidence,
        reasons,
    }
}
