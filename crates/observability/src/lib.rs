use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const CYCLES: &str = "governance.cycles";
pub const CYCLE_ABORTED: &str = "governance.cycle_aborted";
pub const FAIL_CLOSED: &str = "governance.fail_closed";
pub const ACTIONS_APPLIED: &str = "governance.actions_applied";
pub const ROLLBACKS: &str = "governance.rollbacks";
pub const PROMOTIONS_SUPPRESSED: &str = "governance.promotions_suppressed";
pub const TWIN_FAILOVER: &str = "governance.twin_failover";
pub const ENTITY_ERRORS: &str = "governance.entity_errors";
pub const STORE_CONFLICTS: &str = "governance.store_conflicts";
pub const ENTITIES_GOVERNED: &str = "governance.entities";

/// Keep the returned guard alive for the lifetime of the process or buffered lines are lost.
pub fn init_tracing(service_name: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_governance_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

pub fn describe_governance_metrics() {
    describe_counter!(CYCLES, Unit::Count, "control-loop cycles started");
    describe_counter!(CYCLE_ABORTED, Unit::Count, "cycles aborted on a fatal store error");
    describe_counter!(FAIL_CLOSED, Unit::Count, "cycles that failed closed on feed error or budget");
    describe_counter!(ACTIONS_APPLIED, Unit::Count, "actions committed to parameter state");
    describe_counter!(ROLLBACKS, Unit::Count, "rollback actions committed");
    describe_counter!(
        PROMOTIONS_SUPPRESSED,
        Unit::Count,
        "promotions dropped at the commit barrier while twin failover is latched"
    );
    describe_counter!(TWIN_FAILOVER, Unit::Count, "twin failover latch transitions to set");
    describe_counter!(ENTITY_ERRORS, Unit::Count, "isolated per-entity evaluation errors");
    describe_counter!(STORE_CONFLICTS, Unit::Count, "configuration store compare-and-swap conflicts");
    describe_gauge!(ENTITIES_GOVERNED, Unit::Count, "entities known to the ledger");
}
