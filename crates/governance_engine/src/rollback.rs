use std::collections::BTreeMap;

use core_types::{EntityLedger, OpenPromotion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTrigger {
    FreshRiskBreach,
    SustainedDegradation,
}

impl RollbackTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreshRiskBreach => "fresh_risk_breach",
            Self::SustainedDegradation => "sustained_degradation",
        }
    }
}

/// Tracks which promotions are still eligible for an exact revert.
#[derive(Debug, Clone, Copy)]
pub struct RollbackManager {
    watch_cycles: u64,
}

impl RollbackManager {
    pub fn new(watch_cycles: u64) -> Self {
        Self {
            watch_cycles: watch_cycles.max(1),
        }
    }

    pub fn is_watched(&self, promotion: &OpenPromotion, cycle_seq: u64) -> bool {
        cycle_seq.saturating_sub(promotion.applied_cycle) <= self.watch_cycles
    }

    /// Drop promotions that left the watch window; they are considered accepted.
    pub fn expire(&self, ledger: &mut EntityLedger, cycle_seq: u64) {
        ledger
            .open_promotions
            .retain(|p| self.is_watched(p, cycle_seq));
    }

    /// Newest watched promotion per parameter. Only these can be reverted exactly,
    /// since anything older has been moved since.
    pub fn newest_per_parameter<'a>(
        &self,
        ledger: &'a EntityLedger,
        cycle_seq: u64,
    ) -> Vec<&'a OpenPromotion> {
        let mut newest = BTreeMap::<&str, &OpenPromotion>::new();
        for promotion in ledger
            .open_promotions
            .iter()
            .filter(|p| self.is_watched(p, cycle_seq))
        {
            let Some(name) = promotion.action.parameter.as_deref() else {
                continue;
            };
            let newer = newest.get(name).map_or(true, |existing| {
                (promotion.applied_cycle, promotion.action.ts_ms)
                    >= (existing.applied_cycle, existing.action.ts_ms)
            });
            if newer {
                newest.insert(name, promotion);
            }
        }
        newest.into_values().collect()
    }

    /// Promotions to undo for `trigger`. A sustained degradation linked to one of the
    /// loop's own promotions reverts only that promotion.
    pub fn revert_targets<'a>(
        &self,
        ledger: &'a EntityLedger,
        cycle_seq: u64,
        trigger: RollbackTrigger,
        linked_intervention: Option<&str>,
    ) -> Vec<&'a OpenPromotion> {
        let newest = self.newest_per_parameter(ledger, cycle_seq);
        if trigger == RollbackTrigger::SustainedDegradation {
            if let Some(linked) = linked_intervention {
                if let Some(hit) = newest.iter().find(|p| p.action.id == linked) {
                    return vec![*hit];
                }
            }
        }
        newest
    }
}

#[cfg(test)]
mod tests {
    use core_types::{Action, ActionKind, EntityId};

    use super::*;

    fn promotion(id: &str, param: &str, cycle: u64) -> OpenPromotion {
        OpenPromotion {
            action: Action {
                id: id.to_string(),
                cycle_seq: cycle,
                entity: EntityId::new("strategy", "ema_long"),
                parameter: Some(param.to_string()),
                kind: ActionKind::Promote,
                from_value: 0.0,
                to_value: 0.0,
                reason: String::new(),
                streak_at_apply: 2,
                reverts: None,
                ts_ms: cycle as i64 * 1_000,
            },
            applied_cycle: cycle,
        }
    }

    fn ledger(promotions: Vec<OpenPromotion>) -> EntityLedger {
        EntityLedger {
            open_promotions: promotions,
            ..EntityLedger::default()
        }
    }

    #[test]
    fn watch_window_expires_old_promotions() {
        let mgr = RollbackManager::new(3);
        let mut l = ledger(vec![promotion("old", "p", 1), promotion("new", "p", 4)]);
        mgr.expire(&mut l, 5);
        assert_eq!(l.open_promotions.len(), 1);
        assert_eq!(l.open_promotions[0].action.id, "new");
    }

    #[test]
    fn newest_promotion_per_parameter_is_targeted() {
        let mgr = RollbackManager::new(3);
        let l = ledger(vec![
            promotion("p_first", "p", 2),
            promotion("q_only", "q", 2),
            promotion("p_second", "p", 4),
        ]);
        let mut ids = mgr
            .revert_targets(&l, 5, RollbackTrigger::FreshRiskBreach, None)
            .into_iter()
            .map(|p| p.action.id.as_str())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, vec!["p_second", "q_only"]);
    }

    #[test]
    fn linked_promotion_narrows_degradation_revert() {
        let mgr = RollbackManager::new(3);
        let l = ledger(vec![promotion("a", "p", 2), promotion("b", "q", 3)]);
        let targets = mgr.revert_targets(&l, 4, RollbackTrigger::SustainedDegradation, Some("a"));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].action.id, "a");

        let unrelated =
            mgr.revert_targets(&l, 4, RollbackTrigger::SustainedDegradation, Some("feed-7"));
        assert_eq!(unrelated.len(), 2);
    }
}
