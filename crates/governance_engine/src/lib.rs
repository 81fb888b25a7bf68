//! Closed-loop parameter governance: one cycle reads outcomes and risk, attributes
//! them, runs the gates, and commits at most one bounded step per parameter.

mod commands;
pub mod config;
mod engine;
pub mod executor;
pub mod gate;
pub mod rollback;
pub mod streak;

#[cfg(test)]
mod tests;

pub use commands::{CommandQueue, OperatorCommand, OperatorOp};
pub use config::{
    ConfigError, CycleConfig, GateConfig, GateThresholds, GovernanceConfig, RollbackConfig,
    StreakConfig,
};
pub use engine::{ActionApplier, EngineDeps, EngineStatus, GovernanceEngine, NoopApplier};
pub use gate::{ProfitGate, ProfitVerdict, ThresholdProfitGate};
