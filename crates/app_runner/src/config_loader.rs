use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::{EntityId, ParameterRef, ParameterState, PromoteDirection};
use governance_engine::{GateThresholds, GovernanceConfig};
use risk_engine::RiskLimits;
use serde::Deserialize;

pub(crate) const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub(crate) governance: GovernanceConfig,
    pub(crate) risk: RiskLimits,
    pub(crate) parameters: Vec<(ParameterRef, ParameterState)>,
    /// Only set when the file names one; the CLI and environment take precedence.
    pub(crate) data_root: Option<PathBuf>,
    pub(crate) bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            governance: GovernanceConfig::default(),
            risk: RiskLimits::default(),
            parameters: Vec::new(),
            data_root: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FilePatch {
    #[serde(rename = "loop")]
    cycle: Option<LoopPatch>,
    gates: Option<GatesPatch>,
    streaks: Option<StreaksPatch>,
    rollback: Option<RollbackPatch>,
    risk: Option<RiskPatch>,
    #[serde(default)]
    parameters: Vec<ParameterDecl>,
}

#[derive(Debug, Default, Deserialize)]
struct LoopPatch {
    tick_secs: Option<u64>,
    cycle_budget_ms: Option<u64>,
    max_commit_attempts: Option<u32>,
    history_retention_days: Option<u32>,
    short_window_mins: Option<u64>,
    long_window_mins: Option<u64>,
    max_scan_records: Option<usize>,
    attribution_lookback_mins: Option<u64>,
    data_root: Option<String>,
    bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ThresholdsPatch {
    profit_floor: Option<f64>,
    loss_ceiling: Option<f64>,
    promote_threshold: Option<f64>,
    rollback_threshold: Option<f64>,
    min_samples: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GatesPatch {
    #[serde(flatten)]
    default: ThresholdsPatch,
    #[serde(default)]
    scopes: BTreeMap<String, ThresholdsPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct StreaksPatch {
    required_cycles: Option<u32>,
    pause_after_cycles: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RollbackPatch {
    watch_cycles: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RiskPatch {
    max_exposure: Option<f64>,
    per_entity_cap: Option<f64>,
    max_leverage: Option<f64>,
    max_drawdown: Option<f64>,
    max_volatility: Option<f64>,
    max_pairwise_correlation: Option<f64>,
    warn_ratio: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ParameterDecl {
    /// `scope:key`
    entity: String,
    name: String,
    value: f64,
    min: f64,
    max: f64,
    step: f64,
    baseline: Option<f64>,
    max_cumulative_drift: f64,
    promote_direction: Option<PromoteDirection>,
}

impl LoopPatch {
    fn apply_to(self, cfg: &mut AppConfig) {
        let gov = &mut cfg.governance;
        if let Some(v) = self.tick_secs {
            gov.cycle.tick_secs = v.clamp(1, 7 * 24 * 3_600);
        }
        if let Some(v) = self.cycle_budget_ms {
            gov.cycle.cycle_budget_ms = v.min(600_000);
        }
        if let Some(v) = self.max_commit_attempts {
            gov.cycle.max_commit_attempts = v.clamp(1, 10);
        }
        if let Some(v) = self.history_retention_days {
            gov.cycle.history_retention_days = v.min(3_650);
        }
        if let Some(v) = self.short_window_mins {
            gov.windows.short_window_mins = v.max(1);
        }
        if let Some(v) = self.long_window_mins {
            gov.windows.long_window_mins = v.max(gov.windows.short_window_mins);
        }
        if let Some(v) = self.max_scan_records {
            gov.windows.max_scan_records = v.clamp(1, 5_000_000);
        }
        if let Some(v) = self.attribution_lookback_mins {
            gov.attribution.lookback_mins = v.max(1);
        }
        if let Some(v) = self.data_root.filter(|v| !v.trim().is_empty()) {
            cfg.data_root = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = self.bind_addr.filter(|v| !v.trim().is_empty()) {
            cfg.bind_addr = v.trim().to_string();
        }
    }
}

impl ThresholdsPatch {
    fn apply_to(self, t: &mut GateThresholds) {
        if let Some(v) = self.profit_floor {
            t.profit_floor = v;
        }
        if let Some(v) = self.loss_ceiling {
            t.loss_ceiling = v;
        }
        if let Some(v) = self.promote_threshold {
            t.promote_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.rollback_threshold {
            t.rollback_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.min_samples {
            t.min_samples = v.max(1);
        }
    }
}

impl RiskPatch {
    pub(crate) fn apply_to(self, cfg: &mut RiskLimits) {
        if let Some(v) = self.max_exposure {
            cfg.max_exposure = v.max(0.0);
        }
        if let Some(v) = self.per_entity_cap {
            cfg.per_entity_cap = v.max(0.0);
        }
        if let Some(v) = self.max_leverage {
            cfg.max_leverage = v.max(0.0);
        }
        if let Some(v) = self.max_drawdown {
            cfg.max_drawdown = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.max_volatility {
            cfg.max_volatility = v.max(0.0);
        }
        if let Some(v) = self.max_pairwise_correlation {
            cfg.max_pairwise_correlation = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.warn_ratio {
            cfg.warn_ratio = v.clamp(0.0, 1.0);
        }
    }
}

impl ParameterDecl {
    fn into_state(self) -> Result<(ParameterRef, ParameterState)> {
        let entity: EntityId = self
            .entity
            .parse()
            .with_context(|| format!("parameter {}: bad entity", self.name))?;
        let pref = ParameterRef::new(entity, self.name.trim());
        let state = ParameterState {
            value: self.value,
            min: self.min,
            max: self.max,
            step: self.step,
            baseline: self.baseline.unwrap_or(self.value),
            max_cumulative_drift: self.max_cumulative_drift,
            promote_direction: self.promote_direction.unwrap_or_default(),
            updated_at_ms: 0,
        };
        state.validate(&pref.to_string())?;
        Ok((pref, state))
    }
}

/// Read the TOML config at `path`. A missing file means defaults; a malformed one is an error.
pub(crate) fn load_app_config(path: &Path) -> Result<AppConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(AppConfig::default());
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    parse_app_config(&raw).with_context(|| format!("parse {}", path.display()))
}

pub(crate) fn parse_app_config(raw: &str) -> Result<AppConfig> {
    let patch: FilePatch = toml::from_str(raw).context("decode toml")?;
    let mut cfg = AppConfig::default();

    if let Some(p) = patch.cycle {
        p.apply_to(&mut cfg);
    }
    if let Some(p) = patch.gates {
        p.default.apply_to(&mut cfg.governance.gates.default);
        for (scope, overrides) in p.scopes {
            // scope overrides start from the shared defaults
            let mut thresholds = cfg.governance.gates.default.clone();
            overrides.apply_to(&mut thresholds);
            cfg.governance.gates.scopes.insert(scope, thresholds);
        }
    }
    if let Some(p) = patch.streaks {
        if let Some(v) = p.required_cycles {
            cfg.governance.streaks.required_cycles = v.clamp(1, 100);
        }
        if let Some(v) = p.pause_after_cycles {
            cfg.governance.streaks.pause_after_cycles = v.clamp(1, 1_000);
        }
    }
    if let Some(v) = patch.rollback.and_then(|p| p.watch_cycles) {
        cfg.governance.rollback.watch_cycles = v.clamp(1, 1_000);
    }
    if let Some(p) = patch.risk {
        p.apply_to(&mut cfg.risk);
    }
    for decl in patch.parameters {
        cfg.parameters.push(decl.into_state()?);
    }
    cfg.governance.validate()?;
    Ok(cfg)
}
