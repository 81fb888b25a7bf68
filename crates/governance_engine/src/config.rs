use std::collections::BTreeMap;

use attribution::AttributionConfig;
use metric_store::WindowConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("gate thresholds for {scope}: {reason}")]
    Thresholds { scope: String, reason: String },
    #[error("streaks: {0}")]
    Streaks(String),
}

/// Profit-gate bands. Promote and rollback bands never overlap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateThresholds {
    pub profit_floor: f64,
    pub loss_ceiling: f64,
    pub promote_threshold: f64,
    pub rollback_threshold: f64,
    pub min_samples: u64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            profit_floor: 0.0,
            loss_ceiling: 0.0,
            promote_threshold: 0.55,
            rollback_threshold: 0.35,
            min_samples: 1,
        }
    }
}

impl GateThresholds {
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Thresholds {
            scope: scope.to_string(),
            reason: reason.to_string(),
        };
        let values = [
            self.profit_floor,
            self.loss_ceiling,
            self.promote_threshold,
            self.rollback_threshold,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite threshold"));
        }
        if !(0.0..=1.0).contains(&self.promote_threshold)
            || !(0.0..=1.0).contains(&self.rollback_threshold)
        {
            return Err(invalid("expectancy thresholds must lie in [0, 1]"));
        }
        if self.rollback_threshold >= self.promote_threshold {
            return Err(invalid("rollback_threshold must be below promote_threshold"));
        }
        if self.loss_ceiling > self.profit_floor {
            return Err(invalid("loss_ceiling must not exceed profit_floor"));
        }
        Ok(())
    }
}

/// One shared threshold set plus optional overrides keyed by entity scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GateConfig {
    pub default: GateThresholds,
    #[serde(default)]
    pub scopes: BTreeMap<String, GateThresholds>,
}

impl GateConfig {
    pub fn for_scope(&self, scope: &str) -> &GateThresholds {
        self.scopes.get(scope).unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate("default")?;
        for (scope, thresholds) in &self.scopes {
            thresholds.validate(scope)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreakConfig {
    pub required_cycles: u32,
    pub pause_after_cycles: u32,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            required_cycles: 2,
            pause_after_cycles: 3,
        }
    }
}

impl StreakConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required_cycles == 0 {
            return Err(ConfigError::Streaks("required_cycles must be at least 1".into()));
        }
        if self.pause_after_cycles == 0 {
            return Err(ConfigError::Streaks(
                "pause_after_cycles must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackConfig {
    /// How many cycles after a promotion it stays eligible for an exact revert.
    pub watch_cycles: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self { watch_cycles: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleConfig {
    pub tick_secs: u64,
    /// Wall-time budget for snapshot acquisition. Zero disables the budget.
    pub cycle_budget_ms: u64,
    pub max_commit_attempts: u32,
    pub history_retention_days: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30 * 60,
            cycle_budget_ms: 5_000,
            max_commit_attempts: 3,
            history_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GovernanceConfig {
    pub cycle: CycleConfig,
    pub windows: WindowConfig,
    pub attribution: AttributionConfig,
    pub gates: GateConfig,
    pub streaks: StreakConfig,
    pub rollback: RollbackConfig,
}

impl GovernanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gates.validate()?;
        self.streaks.validate()
    }
}
