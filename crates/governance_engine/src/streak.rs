use core_types::{GateDecision, StreakCounter};

use crate::config::StreakConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakOutcome {
    Promote,
    Rollback,
    NoEvidence,
}

impl StreakOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Rollback => "rollback",
            Self::NoEvidence => "no_evidence",
        }
    }
}

pub fn classify(decision: &GateDecision) -> StreakOutcome {
    if decision.profit_gate_pass && decision.risk_gate_pass {
        StreakOutcome::Promote
    } else if decision.rollback_gate_pass {
        StreakOutcome::Rollback
    } else {
        StreakOutcome::NoEvidence
    }
}

/// Exactly one counter moves per cycle; the other two reset.
pub fn advance(counter: StreakCounter, outcome: StreakOutcome) -> StreakCounter {
    match outcome {
        StreakOutcome::Promote => StreakCounter {
            promote_count: counter.promote_count.saturating_add(1),
            rollback_count: 0,
            no_evidence_count: 0,
        },
        StreakOutcome::Rollback => StreakCounter {
            promote_count: 0,
            rollback_count: counter.rollback_count.saturating_add(1),
            no_evidence_count: 0,
        },
        StreakOutcome::NoEvidence => StreakCounter {
            promote_count: 0,
            rollback_count: 0,
            no_evidence_count: counter.no_evidence_count.saturating_add(1),
        },
    }
}

impl StreakConfig {
    pub fn promote_fired(&self, c: &StreakCounter) -> bool {
        c.promote_count >= self.required_cycles
    }

    pub fn rollback_fired(&self, c: &StreakCounter) -> bool {
        c.rollback_count >= self.required_cycles
    }

    pub fn pause_due(&self, c: &StreakCounter) -> bool {
        c.no_evidence_count >= self.pause_after_cycles
    }
}

#[cfg(test)]
mod tests {
    use core_types::EntityId;

    use super::*;

    fn decision(profit: bool, rollback: bool, risk: bool) -> GateDecision {
        GateDecision {
            entity: EntityId::new("strategy", "ema_long"),
            profit_gate_pass: profit,
            rollback_gate_pass: rollback,
            risk_gate_pass: risk,
            insufficient_evidence: !profit && !rollback,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn opposite_outcome_resets_counters() {
        let mut c = StreakCounter::default();
        c = advance(c, classify(&decision(true, false, true)));
        assert_eq!(c.promote_count, 1);
        c = advance(c, classify(&decision(false, true, true)));
        assert_eq!(
            c,
            StreakCounter {
                promote_count: 0,
                rollback_count: 1,
                no_evidence_count: 0
            }
        );
    }

    #[test]
    fn vetoed_profit_pass_does_not_count_toward_promotion() {
        assert_eq!(
            classify(&decision(true, false, false)),
            StreakOutcome::NoEvidence
        );
    }

    #[test]
    fn alternating_feed_never_fires() {
        let cfg = StreakConfig::default();
        let mut c = StreakCounter::default();
        for i in 0..10 {
            let d = if i % 2 == 0 {
                decision(true, false, true)
            } else {
                decision(false, true, true)
            };
            c = advance(c, classify(&d));
            assert!(!cfg.promote_fired(&c));
            assert!(!cfg.rollback_fired(&c));
        }
    }

    #[test]
    fn empty_evidence_never_counts_as_rollback() {
        let mut c = StreakCounter::default();
        for _ in 0..5 {
            c = advance(c, classify(&decision(false, false, true)));
        }
        assert_eq!(c.rollback_count, 0);
        assert!(StreakConfig::default().pause_due(&c));
    }
}
