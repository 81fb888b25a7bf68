use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use core_types::{EntityId, RiskSnapshot, Severity};
use serde::{Deserialize, Serialize};

/// Portfolio limits. A non-positive limit disables that check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskLimits {
    pub max_exposure: f64,
    pub per_entity_cap: f64,
    pub max_leverage: f64,
    pub max_drawdown: f64,
    pub max_volatility: f64,
    pub max_pairwise_correlation: f64,
    /// Fraction of a limit above which severity is raised to warn.
    pub warn_ratio: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_exposure: 1_000.0,
            per_entity_cap: 250.0,
            max_leverage: 3.0,
            max_drawdown: 0.15,
            max_volatility: 0.05,
            max_pairwise_correlation: 0.85,
            warn_ratio: 0.80,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    TotalExposure,
    PerEntityCap,
    Leverage,
    Drawdown,
    Volatility,
    Correlation,
    LinkedCorrelation,
    LockPoisoned,
}

impl BreachKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalExposure => "total_exposure",
            Self::PerEntityCap => "per_entity_cap",
            Self::Leverage => "leverage",
            Self::Drawdown => "drawdown",
            Self::Volatility => "volatility",
            Self::Correlation => "correlation",
            Self::LinkedCorrelation => "linked_correlation",
            Self::LockPoisoned => "risk_lock_poisoned",
        }
    }

    pub fn is_portfolio(self) -> bool {
        matches!(
            self,
            Self::TotalExposure | Self::Leverage | Self::Drawdown | Self::LockPoisoned
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskBreach {
    pub kind: BreachKind,
    pub entity: Option<EntityId>,
    pub observed: f64,
    pub limit: f64,
}

impl RiskBreach {
    fn reason(&self) -> String {
        format!(
            "risk:{} observed={:.6} limit={:.6}",
            self.kind.as_str(),
            self.observed,
            self.limit
        )
    }
}

/// One evaluation of a `RiskSnapshot`, shared read-only by every entity in a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskAssessment {
    pub breaches: Vec<RiskBreach>,
    pub vetoed: BTreeMap<EntityId, Vec<String>>,
    /// Set when the limits could not be read; every entity is vetoed.
    pub veto_all: bool,
    pub warnings: Vec<String>,
    pub severity: Severity,
}

impl RiskAssessment {
    pub fn fail_closed(reason: &str) -> Self {
        Self {
            breaches: vec![RiskBreach {
                kind: BreachKind::LockPoisoned,
                entity: None,
                observed: 0.0,
                limit: 0.0,
            }],
            vetoed: BTreeMap::new(),
            veto_all: true,
            warnings: vec![reason.to_string()],
            severity: Severity::Critical,
        }
    }

    pub fn is_vetoed(&self, entity: &EntityId) -> bool {
        self.veto_all || self.vetoed.contains_key(entity)
    }

    pub fn veto_reasons(&self, entity: &EntityId) -> Vec<String> {
        if self.veto_all {
            return vec![format!("risk:{}", BreachKind::LockPoisoned.as_str())];
        }
        self.vetoed.get(entity).cloned().unwrap_or_default()
    }

    pub fn has_portfolio_breach(&self) -> bool {
        self.breaches.iter().any(|b| b.kind.is_portfolio())
    }

    fn veto(&mut self, entity: &EntityId, reason: String) {
        let reasons = self.vetoed.entry(entity.clone()).or_default();
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
}

pub trait RiskGate: Send + Sync {
    /// `entities` is every entity the loop knows about; portfolio-wide breaches veto from it.
    fn assess(&self, snapshot: &RiskSnapshot, entities: &[EntityId]) -> RiskAssessment;
}

pub struct PortfolioRiskGate {
    limits: Arc<RwLock<RiskLimits>>,
}

impl PortfolioRiskGate {
    pub fn new(limits: Arc<RwLock<RiskLimits>>) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> Arc<RwLock<RiskLimits>> {
        self.limits.clone()
    }
}

impl RiskGate for PortfolioRiskGate {
    fn assess(&self, snapshot: &RiskSnapshot, entities: &[EntityId]) -> RiskAssessment {
        let limits = match self.limits.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                tracing::error!("risk limits lock poisoned; vetoing every entity");
                return RiskAssessment::fail_closed("risk_lock_poisoned");
            }
        };
        assess_with_limits(snapshot, entities, &limits)
    }
}

fn enabled(limit: f64) -> bool {
    limit.is_finite() && limit > 0.0
}

pub fn assess_with_limits(
    snapshot: &RiskSnapshot,
    entities: &[EntityId],
    limits: &RiskLimits,
) -> RiskAssessment {
    let mut out = RiskAssessment::default();
    let warn_ratio = limits.warn_ratio.clamp(0.0, 1.0);

    let mut universe: BTreeSet<EntityId> = entities.iter().cloned().collect();
    universe.extend(snapshot.per_entity_exposure.keys().cloned());
    universe.extend(snapshot.volatility.keys().cloned());

    let near_limit = |name: &str, observed: f64, limit: f64, warnings: &mut Vec<String>| {
        if enabled(limit) && observed > limit * warn_ratio && observed <= limit {
            warnings.push(format!("near_limit:{name} observed={observed:.6} limit={limit:.6}"));
        }
    };

    // Portfolio-wide checks.
    let total = snapshot.total_exposure.abs();
    near_limit("total_exposure", total, limits.max_exposure, &mut out.warnings);
    if enabled(limits.max_exposure) && total > limits.max_exposure {
        let breach = RiskBreach {
            kind: BreachKind::TotalExposure,
            entity: None,
            observed: total,
            limit: limits.max_exposure,
        };
        let reason = breach.reason();
        for entity in &universe {
            if snapshot.exposure_of(entity) > 0.0 {
                out.veto(entity, reason.clone());
            }
        }
        out.breaches.push(breach);
    }

    let leverage = snapshot.max_leverage.abs();
    near_limit("leverage", leverage, limits.max_leverage, &mut out.warnings);
    if enabled(limits.max_leverage) && leverage > limits.max_leverage {
        let breach = RiskBreach {
            kind: BreachKind::Leverage,
            entity: None,
            observed: leverage,
            limit: limits.max_leverage,
        };
        let reason = breach.reason();
        for entity in &universe {
            out.veto(entity, reason.clone());
        }
        out.breaches.push(breach);
    }

    let drawdown = snapshot.max_drawdown_window.abs();
    near_limit("drawdown", drawdown, limits.max_drawdown, &mut out.warnings);
    if enabled(limits.max_drawdown) && drawdown > limits.max_drawdown {
        let breach = RiskBreach {
            kind: BreachKind::Drawdown,
            entity: None,
            observed: drawdown,
            limit: limits.max_drawdown,
        };
        let reason = breach.reason();
        for entity in &universe {
            out.veto(entity, reason.clone());
        }
        out.breaches.push(breach);
    }

    // Per-entity checks.
    for entity in &universe {
        let exposure = snapshot.exposure_of(entity);
        near_limit(
            &format!("per_entity_cap:{entity}"),
            exposure,
            limits.per_entity_cap,
            &mut out.warnings,
        );
        if enabled(limits.per_entity_cap) && exposure > limits.per_entity_cap {
            let breach = RiskBreach {
                kind: BreachKind::PerEntityCap,
                entity: Some(entity.clone()),
                observed: exposure,
                limit: limits.per_entity_cap,
            };
            out.veto(entity, breach.reason());
            out.breaches.push(breach);
        }

        let vol = snapshot.volatility.get(entity).copied().unwrap_or(0.0).abs();
        near_limit(
            &format!("volatility:{entity}"),
            vol,
            limits.max_volatility,
            &mut out.warnings,
        );
        if enabled(limits.max_volatility) && vol > limits.max_volatility {
            let breach = RiskBreach {
                kind: BreachKind::Volatility,
                entity: Some(entity.clone()),
                observed: vol,
                limit: limits.max_volatility,
            };
            out.veto(entity, breach.reason());
            out.breaches.push(breach);
        }
    }

    // Entities vetoed before any correlation rule; linkage propagates from these only.
    let primary_vetoed: BTreeSet<EntityId> = out.vetoed.keys().cloned().collect();

    if enabled(limits.max_pairwise_correlation) {
        for pair in &snapshot.pairwise_correlation {
            let corr = pair.correlation.abs();
            if !corr.is_finite() {
                continue;
            }
            near_limit(
                &format!("correlation:{}~{}", pair.a, pair.b),
                corr,
                limits.max_pairwise_correlation,
                &mut out.warnings,
            );
            if corr <= limits.max_pairwise_correlation {
                continue;
            }
            let exp_a = snapshot.exposure_of(&pair.a);
            let exp_b = snapshot.exposure_of(&pair.b);
            let offenders: Vec<&EntityId> = if (exp_a - exp_b).abs() <= f64::EPSILON {
                vec![&pair.a, &pair.b]
            } else if exp_a > exp_b {
                vec![&pair.a]
            } else {
                vec![&pair.b]
            };
            for offender in offenders {
                let breach = RiskBreach {
                    kind: BreachKind::Correlation,
                    entity: Some(offender.clone()),
                    observed: corr,
                    limit: limits.max_pairwise_correlation,
                };
                out.veto(offender, breach.reason());
                out.breaches.push(breach);
            }

            for (vetoed, other) in [(&pair.a, &pair.b), (&pair.b, &pair.a)] {
                if primary_vetoed.contains(vetoed) {
                    let breach = RiskBreach {
                        kind: BreachKind::LinkedCorrelation,
                        entity: Some(other.clone()),
                        observed: corr,
                        limit: limits.max_pairwise_correlation,
                    };
                    out.veto(other, format!("{} linked_to={vetoed}", breach.reason()));
                    out.breaches.push(breach);
                }
            }
        }
    }

    out.severity = if out.has_portfolio_breach() {
        Severity::Critical
    } else if !out.breaches.is_empty() || !out.warnings.is_empty() {
        Severity::Warn
    } else {
        Severity::Ok
    };
    out
}

#[cfg(test)]
mod tests {
    use core_types::CorrelationPair;

    use super::*;

    fn id(key: &str) -> EntityId {
        EntityId::new("strategy", key)
    }

    fn snapshot() -> RiskSnapshot {
        let mut snap = RiskSnapshot {
            total_exposure: 300.0,
            max_leverage: 1.0,
            max_drawdown_window: 0.02,
            ..RiskSnapshot::default()
        };
        snap.per_entity_exposure.insert(id("a"), 150.0);
        snap.per_entity_exposure.insert(id("b"), 100.0);
        snap.per_entity_exposure.insert(id("c"), 50.0);
        snap
    }

    fn gate() -> PortfolioRiskGate {
        PortfolioRiskGate::new(Arc::new(RwLock::new(RiskLimits::default())))
    }

    #[test]
    fn clean_snapshot_is_ok() {
        let a = gate().assess(&snapshot(), &[id("a"), id("b")]);
        assert_eq!(a.severity, Severity::Ok);
        assert!(a.breaches.is_empty());
        assert!(!a.is_vetoed(&id("a")));
    }

    #[test]
    fn per_entity_cap_vetoes_only_offender() {
        let mut snap = snapshot();
        snap.per_entity_exposure.insert(id("a"), 400.0);
        let a = gate().assess(&snap, &[]);
        assert!(a.is_vetoed(&id("a")));
        assert!(!a.is_vetoed(&id("b")));
        assert_eq!(a.severity, Severity::Warn);
        assert!(a.veto_reasons(&id("a"))[0].starts_with("risk:per_entity_cap"));
    }

    #[test]
    fn correlation_breach_vetoes_higher_exposed_member() {
        let mut snap = snapshot();
        snap.pairwise_correlation.push(CorrelationPair {
            a: id("a"),
            b: id("b"),
            correlation: 0.95,
        });
        let a = gate().assess(&snap, &[]);
        assert!(a.is_vetoed(&id("a")));
        assert!(!a.is_vetoed(&id("b")));
    }

    #[test]
    fn correlation_tie_vetoes_both() {
        let mut snap = snapshot();
        snap.per_entity_exposure.insert(id("b"), 150.0);
        snap.pairwise_correlation.push(CorrelationPair {
            a: id("a"),
            b: id("b"),
            correlation: -0.9,
        });
        let a = gate().assess(&snap, &[]);
        assert!(a.is_vetoed(&id("a")));
        assert!(a.is_vetoed(&id("b")));
    }

    #[test]
    fn correlated_partner_of_capped_entity_is_linked() {
        let mut snap = snapshot();
        snap.volatility.insert(id("c"), 0.2);
        snap.pairwise_correlation.push(CorrelationPair {
            a: id("b"),
            b: id("c"),
            correlation: 0.9,
        });
        let a = gate().assess(&snap, &[]);
        assert!(a.is_vetoed(&id("c")));
        // b is the higher-exposed member and also linked to c
        assert!(a.is_vetoed(&id("b")));
        assert!(a
            .veto_reasons(&id("b"))
            .iter()
            .any(|r| r.contains("linked_to=strategy:c")));
        assert!(!a.is_vetoed(&id("a")));
    }

    #[test]
    fn leverage_breach_is_critical_and_vetoes_everyone() {
        let mut snap = snapshot();
        snap.max_leverage = 5.0;
        let a = gate().assess(&snap, &[id("idle")]);
        assert_eq!(a.severity, Severity::Critical);
        assert!(a.is_vetoed(&id("idle")));
        assert!(a.is_vetoed(&id("c")));
    }

    #[test]
    fn total_exposure_breach_vetoes_exposed_entities_only() {
        let mut snap = snapshot();
        snap.total_exposure = 1_500.0;
        let a = gate().assess(&snap, &[id("idle")]);
        assert_eq!(a.severity, Severity::Critical);
        assert!(a.is_vetoed(&id("a")));
        assert!(!a.is_vetoed(&id("idle")));
    }

    #[test]
    fn near_limit_raises_warn_without_veto() {
        let mut snap = snapshot();
        snap.max_drawdown_window = 0.13;
        let a = gate().assess(&snap, &[]);
        assert_eq!(a.severity, Severity::Warn);
        assert!(a.vetoed.is_empty());
    }

    #[test]
    fn poisoned_limits_fail_closed() {
        let limits = Arc::new(RwLock::new(RiskLimits::default()));
        let poisoner = limits.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().expect("write");
            panic!("poison");
        })
        .join();
        let a = PortfolioRiskGate::new(limits).assess(&snapshot(), &[]);
        assert!(a.veto_all);
        assert!(a.is_vetoed(&id("anything")));
        assert_eq!(a.severity, Severity::Critical);
    }

    #[test]
    fn disabled_limit_never_breaches() {
        let limits = RiskLimits {
            max_leverage: 0.0,
            ..RiskLimits::default()
        };
        let mut snap = snapshot();
        snap.max_leverage = 50.0;
        let a = assess_with_limits(&snap, &[], &limits);
        assert!(a.breaches.is_empty());
    }
}
