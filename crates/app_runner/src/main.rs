use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use causal_log::JsonlCausalLog;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config_store::{FileConfigStore, GovernanceDocument};
use core_types::{Action, CycleSummary};
use feed_jsonl::{JsonlInterventionFeed, JsonlOutcomeFeed, JsonlRecorder, JsonlRiskSource};
use governance_engine::{ActionApplier, EngineDeps, GovernanceEngine};
use infra_clock::{Clock, SharedClock, SystemClock};
use metrics_exporter_prometheus::PrometheusHandle;
use observability::{init_metrics, init_tracing};
use risk_engine::{PortfolioRiskGate, RiskLimits};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config_loader::AppConfig;

mod config_loader;
mod control_api;
#[cfg(test)]
mod tests;

const APPLIED_ACTIONS_FILE_NAME: &str = "applied_actions.jsonl";

#[derive(Parser, Debug)]
#[command(name = "govloop", about = "Adaptive governance control loop", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "GOVLOOP_CONFIG_PATH",
        default_value = "configs/governance.toml"
    )]
    config: PathBuf,
    #[arg(long, global = true, env = "GOVLOOP_DATA_ROOT")]
    data_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a cycle every tick and serve the control API.
    Run {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one cycle and print its summary.
    Once,
    /// Print stored parameters, entity ledgers and twin status.
    Status,
    /// Print the most recent cycle summaries.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Directory layout under the data root.
#[derive(Debug, Clone)]
pub(crate) struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn dir(&self, kind: &str) -> PathBuf {
        self.root.join(kind)
    }

    pub(crate) fn ensure(&self) -> Result<()> {
        for kind in ["state", "feeds", "logs", "reports"] {
            let dir = self.dir(kind);
            std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Hands committed actions to the governed system through an append-only JSONL file.
struct ActionRecorder {
    recorder: JsonlRecorder,
}

#[derive(Serialize)]
struct AppliedRecord<'a> {
    ts_ms: i64,
    store_version: u64,
    action: &'a Action,
}

impl ActionApplier for ActionRecorder {
    fn apply(&self, actions: &[Action], doc: &GovernanceDocument) -> Result<()> {
        let rows = actions
            .iter()
            .map(|action| AppliedRecord {
                ts_ms: action.ts_ms,
                store_version: doc.version,
                action,
            })
            .collect::<Vec<_>>();
        self.recorder
            .write_all(&rows)
            .with_context(|| format!("append {}", self.recorder.path().display()))
    }
}

pub(crate) struct Runtime {
    pub(crate) engine: Arc<GovernanceEngine>,
    pub(crate) log: Arc<JsonlCausalLog>,
    pub(crate) risk_limits: Arc<StdRwLock<RiskLimits>>,
    pub(crate) clock: SharedClock,
}

pub(crate) fn build_runtime(cfg: &AppConfig, layout: &DataLayout) -> Result<Runtime> {
    layout.ensure()?;
    let feeds = layout.dir("feeds");
    let log = Arc::new(JsonlCausalLog::new(layout.dir("logs")));
    let risk_limits = Arc::new(StdRwLock::new(cfg.risk.clone()));
    let clock: SharedClock = Arc::new(SystemClock);
    let deps = EngineDeps {
        store: Arc::new(FileConfigStore::in_dir(layout.dir("state"))),
        outcomes: Arc::new(JsonlOutcomeFeed::in_dir(&feeds)),
        interventions: Arc::new(JsonlInterventionFeed::in_dir(&feeds)),
        risk_source: Arc::new(JsonlRiskSource::in_dir(&feeds)),
        risk_gate: Arc::new(PortfolioRiskGate::new(risk_limits.clone())),
        sink: log.clone(),
        clock: clock.clone(),
    };
    let recorder = JsonlRecorder::open(layout.dir("reports").join(APPLIED_ACTIONS_FILE_NAME))?;
    let engine = GovernanceEngine::with_defaults(cfg.governance.clone(), deps)
        .context("governance config")?
        .with_applier(Box::new(ActionRecorder { recorder }));
    let seeded = engine
        .seed_parameters(&cfg.parameters)
        .context("seed declared parameters")?;
    tracing::info!(
        root = %layout.root.display(),
        declared = cfg.parameters.len(),
        seeded,
        "governance runtime ready"
    );
    Ok(Runtime {
        engine: Arc::new(engine),
        log,
        risk_limits,
        clock,
    })
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: Arc<GovernanceEngine>,
    pub(crate) log: Arc<JsonlCausalLog>,
    pub(crate) risk_limits: Arc<StdRwLock<RiskLimits>>,
    pub(crate) clock: SharedClock,
    /// Serializes timer-driven and operator-triggered cycles.
    pub(crate) cycle_lock: Arc<Mutex<()>>,
    pub(crate) last_summary: Arc<RwLock<Option<CycleSummary>>>,
    pub(crate) prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub(crate) fn new(rt: Runtime, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            engine: rt.engine,
            log: rt.log,
            risk_limits: rt.risk_limits,
            clock: rt.clock,
            cycle_lock: Arc::new(Mutex::new(())),
            last_summary: Arc::new(RwLock::new(None)),
            prometheus,
        }
    }
}

pub(crate) async fn run_cycle_now(state: &AppState) -> Result<CycleSummary> {
    let _guard = state.cycle_lock.lock().await;
    let engine = state.engine.clone();
    let summary = tokio::task::spawn_blocking(move || engine.run_cycle())
        .await
        .context("cycle task failed")?;
    *state.last_summary.write().await = Some(summary.clone());
    Ok(summary)
}

async fn archive_history(state: &AppState, retention_days: u32) {
    let log = state.log.clone();
    let now_ms = state.clock.now_ms();
    match tokio::task::spawn_blocking(move || log.archive_old(retention_days, now_ms)).await {
        Ok(Ok(archived)) if archived > 0 => {
            tracing::info!(archived, retention_days, "archived old cycle history");
        }
        Ok(Ok(_)) => {}
        Ok(Err(err)) => tracing::warn!(error = %format!("{err:#}"), "history archival failed"),
        Err(err) => tracing::warn!(error = %err, "history archival task failed"),
    }
}

fn spawn_cycle_loop(state: AppState, tick: Duration, retention_days: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut archived_on = None;
        loop {
            interval.tick().await;
            if let Err(err) = run_cycle_now(&state).await {
                tracing::error!(error = %format!("{err:#}"), "governance cycle did not complete");
            }
            let today = Utc::now().date_naive();
            if retention_days > 0 && archived_on != Some(today) {
                archive_history(&state, retention_days).await;
                archived_on = Some(today);
            }
        }
    });
}

async fn run(cfg: AppConfig, layout: DataLayout, bind: Option<String>) -> Result<()> {
    let prometheus = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "prometheus recorder unavailable; /metrics is empty");
            None
        }
    };
    let state = AppState::new(build_runtime(&cfg, &layout)?, prometheus);
    let tick = Duration::from_secs(cfg.governance.cycle.tick_secs.max(1));
    spawn_cycle_loop(
        state.clone(),
        tick,
        cfg.governance.cycle.history_retention_days,
    );

    let app = control_api::build_router(state);
    let addr: SocketAddr = bind
        .unwrap_or(cfg.bind_addr)
        .parse()
        .context("parse bind address")?;
    tracing::info!(%addr, tick_secs = tick.as_secs(), "control api started");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolve_data_root(cli_root: Option<PathBuf>, cfg: &AppConfig) -> PathBuf {
    cli_root
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| cfg.data_root.clone())
        .unwrap_or_else(|| PathBuf::from("datasets"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing("govloop");
    let cfg = config_loader::load_app_config(&cli.config)?;
    let layout = DataLayout::new(resolve_data_root(cli.data_root, &cfg));

    match cli.command {
        Commands::Run { bind } => run(cfg, layout, bind).await,
        Commands::Once => {
            let rt = build_runtime(&cfg, &layout)?;
            let engine = rt.engine.clone();
            let summary = tokio::task::spawn_blocking(move || engine.run_cycle()).await?;
            print_json(&summary)
        }
        Commands::Status => {
            let rt = build_runtime(&cfg, &layout)?;
            print_json(&rt.engine.status()?)
        }
        Commands::History { limit } => {
            let rt = build_runtime(&cfg, &layout)?;
            print_json(&rt.engine.history(limit)?)
        }
    }
}
