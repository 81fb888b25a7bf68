use core_types::{AttributionRecord, InterventionEvent, MetricWindow};
use infra_clock::mins_to_ms;
use serde::{Deserialize, Serialize};

/// Kind tag for interventions produced by the loop itself.
pub const GOVERNANCE_ACTION_KIND: &str = "governance_action";

/// Scores how reliable the short window's edge looks, in `[0, 1]`.
pub trait ExpectancyModel: Send + Sync {
    fn expectancy(&self, short: &MetricWindow, long: &MetricWindow) -> f64;
}

/// Short-window hit rate. Empty windows score zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinRateExpectancy;

impl ExpectancyModel for WinRateExpectancy {
    fn expectancy(&self, short: &MetricWindow, _long: &MetricWindow) -> f64 {
        short.win_rate().clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionConfig {
    pub lookback_mins: u64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self { lookback_mins: 30 }
    }
}

pub struct AttributionEngine {
    lookback_ms: i64,
    own_action_lookback_ms: i64,
    model: Box<dyn ExpectancyModel>,
}

impl AttributionEngine {
    pub fn new(cfg: &AttributionConfig) -> Self {
        Self::with_model(cfg, Box::new(WinRateExpectancy))
    }

    pub fn with_model(cfg: &AttributionConfig, model: Box<dyn ExpectancyModel>) -> Self {
        let lookback_ms = mins_to_ms(cfg.lookback_mins.max(1));
        Self {
            lookback_ms,
            own_action_lookback_ms: lookback_ms,
            model,
        }
    }

    /// Reach for `governance_action` interventions, which stay linkable for as long as
    /// the promotion they describe can still be reverted. Never shorter than the lookback.
    pub fn with_own_action_lookback(mut self, lookback_ms: i64) -> Self {
        self.own_action_lookback_ms = lookback_ms.max(self.lookback_ms);
        self
    }

    pub fn lookback_ms(&self) -> i64 {
        self.lookback_ms
    }

    /// Pair the entity's uplift with the most recent intervention that touched it
    /// inside `[now - lookback, now]`. Correlation in time only.
    /// The loop's own actions use the longer own-action lookback.
    pub fn attribute(
        &self,
        short: &MetricWindow,
        long: &MetricWindow,
        interventions: &[InterventionEvent],
        now_ms: i64,
    ) -> AttributionRecord {
        let entity = short.entity.clone();
        let uplift = if short.has_evidence() {
            short.avg_return - long.avg_return
        } else {
            0.0
        };
        let linked_intervention = self
            .latest_touching(interventions, &entity, now_ms)
            .map(|ev| ev.id.clone());
        AttributionRecord {
            entity,
            uplift,
            expectancy_score: self.model.expectancy(short, long),
            short: short.clone(),
            long: long.clone(),
            linked_intervention,
        }
    }

    fn latest_touching<'a>(
        &self,
        interventions: &'a [InterventionEvent],
        entity: &core_types::EntityId,
        now_ms: i64,
    ) -> Option<&'a InterventionEvent> {
        interventions
            .iter()
            .filter(|ev| {
                let reach = if ev.kind == GOVERNANCE_ACTION_KIND {
                    self.own_action_lookback_ms
                } else {
                    self.lookback_ms
                };
                ev.touches(entity) && ev.ts_ms >= now_ms.saturating_sub(reach) && ev.ts_ms <= now_ms
            })
            // ties on ts prefer the later entry in feed order
            .max_by(|a, b| a.ts_ms.cmp(&b.ts_ms))
    }
}
