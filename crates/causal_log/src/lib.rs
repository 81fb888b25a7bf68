use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, TimeZone, Utc};
use core_types::{
    Action, AttributionRecord, CausalEdge, CausalSink, CycleSummary, GateDecision, TwinState,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

pub const EDGES_FILE_NAME: &str = "causal_edges.jsonl";
pub const SUMMARIES_FILE_NAME: &str = "cycle_summaries.jsonl";

/// Collects the triples one cycle emits, in evaluation order.
#[derive(Debug, Clone)]
pub struct EdgeBuilder {
    ts_ms: i64,
    cycle_seq: u64,
    edges: Vec<CausalEdge>,
}

impl EdgeBuilder {
    pub fn new(ts_ms: i64, cycle_seq: u64) -> Self {
        Self {
            ts_ms,
            cycle_seq,
            edges: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> &mut Self {
        self.edges.push(CausalEdge::new(
            self.ts_ms,
            self.cycle_seq,
            subject,
            predicate,
            object,
        ));
        self
    }

    pub fn attribution(&mut self, rec: &AttributionRecord) -> &mut Self {
        let subject = rec.entity.to_string();
        self.push(
            &subject,
            "metric_short",
            format!(
                "avg_return={:.6} samples={} wins={}",
                rec.short.avg_return, rec.short.sample_count, rec.short.win_count
            ),
        );
        self.push(
            &subject,
            "metric_long",
            format!(
                "avg_return={:.6} samples={}",
                rec.long.avg_return, rec.long.sample_count
            ),
        );
        self.push(
            &subject,
            "uplift",
            format!("{:.6} expectancy={:.4}", rec.uplift, rec.expectancy_score),
        );
        if let Some(linked) = &rec.linked_intervention {
            self.push(&subject, "linked_intervention", linked);
        }
        self
    }

    pub fn gate(&mut self, decision: &GateDecision) -> &mut Self {
        let outcome = if decision.insufficient_evidence {
            "no_evidence"
        } else if decision.promote_eligible() {
            "promote_eligible"
        } else if decision.rollback_gate_pass {
            "rollback_eligible"
        } else {
            "hold"
        };
        let reasons = if decision.reasons.is_empty() {
            String::new()
        } else {
            format!(" reasons={}", decision.reasons.join(","))
        };
        self.push(
            decision.entity.to_string(),
            "gate_decision",
            format!(
                "{outcome} profit={} rollback={} risk={}{reasons}",
                decision.profit_gate_pass, decision.rollback_gate_pass, decision.risk_gate_pass
            ),
        )
    }

    /// An action and its edge back to the entity and parameter it moved.
    pub fn action(&mut self, action: &Action) -> &mut Self {
        let target = action
            .parameter_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| action.entity.to_string());
        self.push(
            format!("action:{}", action.id),
            action.kind.as_str(),
            format!(
                "{target} {:.6}->{:.6} reason={}",
                action.from_value, action.to_value, action.reason
            ),
        );
        if let Some(prior) = &action.reverts {
            self.push(format!("action:{}", action.id), "reverts", format!("action:{prior}"));
        }
        self
    }

    pub fn suppressed(&mut self, action: &Action) -> &mut Self {
        self.push(
            format!("action:{}", action.id),
            "suppressed_by",
            "twin_failover",
        )
    }

    pub fn twin(&mut self, twin: &TwinState) -> &mut Self {
        let mode = match twin.execution_bridge_mode {
            core_types::ExecutionBridgeMode::Primary => "primary",
            core_types::ExecutionBridgeMode::Twin => "twin",
        };
        let divergent = twin.divergent_fields.join(",");
        self.push(
            "twin",
            "execution_bridge_mode",
            format!(
                "{mode} failover={} divergent=[{divergent}]",
                twin.failover_triggered
            ),
        )
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn finish(self) -> Vec<CausalEdge> {
        self.edges
    }
}

/// Line-delimited JSON log under one directory. Single writer.
pub struct JsonlCausalLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlCausalLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn edges_path(&self) -> PathBuf {
        self.dir.join(EDGES_FILE_NAME)
    }

    pub fn summaries_path(&self) -> PathBuf {
        self.dir.join(SUMMARIES_FILE_NAME)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).context("create causal log dir")
    }

    fn append_lines<T: serde::Serialize>(&self, path: &Path, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.ensure_dir()?;
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row).context("serialize causal log row")?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        Ok(())
    }

    pub fn load_edges(&self, limit: usize) -> Result<Vec<CausalEdge>> {
        read_tail(&self.edges_path(), limit)
    }

    /// Move summaries and edges older than `retention_days` into monthly gzip archives.
    pub fn archive_old(&self, retention_days: u32, now_ms: i64) -> Result<usize> {
        let _guard = self.write_lock.lock();
        self.ensure_dir()?;
        let cutoff_ms =
            now_ms.saturating_sub((retention_days as i64).saturating_mul(24 * 3_600 * 1_000));
        let summaries = archive_file::<CycleSummary>(
            &self.summaries_path(),
            &self.dir,
            "cycle_summaries",
            cutoff_ms,
            |s| s.ts_ms,
        )?;
        let edges = archive_file::<CausalEdge>(
            &self.edges_path(),
            &self.dir,
            "causal_edges",
            cutoff_ms,
            |e| e.ts_ms,
        )?;
        if summaries + edges > 0 {
            tracing::info!(summaries, edges, retention_days, "archived causal log records");
        }
        Ok(summaries + edges)
    }
}

impl CausalSink for JsonlCausalLog {
    fn append_edges(&self, edges: &[CausalEdge]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.append_lines(&self.edges_path(), edges)
    }

    fn append_summary(&self, summary: &CycleSummary) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.append_lines(&self.summaries_path(), std::slice::from_ref(summary))
    }

    fn latest_summary(&self) -> Result<Option<CycleSummary>> {
        let path = self.summaries_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("open cycle summaries"),
        };
        let lines = BufReader::new(file)
            .lines()
            .map_while(std::result::Result::ok)
            .collect::<Vec<_>>();
        Ok(lines
            .into_iter()
            .rev()
            .find_map(|line| serde_json::from_str::<CycleSummary>(&line).ok()))
    }

    fn history(&self, limit: usize) -> Result<Vec<CycleSummary>> {
        read_tail(&self.summaries_path(), limit)
    }
}

fn read_tail<T: DeserializeOwned>(path: &Path, limit: usize) -> Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let mut out = Vec::new();
    for line in BufReader::new(file).lines().map_while(std::result::Result::ok) {
        if let Ok(row) = serde_json::from_str::<T>(&line) {
            out.push(row);
        }
    }
    if out.len() > limit {
        out.drain(..out.len() - limit);
    }
    Ok(out)
}

fn month_bucket(ts_ms: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Utc::now);
    format!("{:04}-{:02}", dt.year(), dt.month())
}

fn archive_file<T: DeserializeOwned>(
    path: &Path,
    dir: &Path,
    stem: &str,
    cutoff_ms: i64,
    ts_of: impl Fn(&T) -> i64,
) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(path).context("open causal log for archive")?;
    let mut keep_lines = Vec::<String>::new();
    let mut buckets = BTreeMap::<String, Vec<String>>::new();
    for line in BufReader::new(file).lines().map_while(std::result::Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        // undecodable rows stay in the live file
        let Ok(row) = serde_json::from_str::<T>(&line) else {
            keep_lines.push(line);
            continue;
        };
        let ts_ms = ts_of(&row);
        if ts_ms < cutoff_ms {
            buckets.entry(month_bucket(ts_ms)).or_default().push(line);
        } else {
            keep_lines.push(line);
        }
    }
    if buckets.is_empty() {
        return Ok(0);
    }

    let mut archived = 0;
    for (month, lines) in buckets {
        let gz_path = dir.join(format!("{stem}_{month}.jsonl.gz"));
        let gz_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(gz_path)
            .context("open monthly archive")?;
        let mut encoder = GzEncoder::new(gz_file, Compression::default());
        for line in &lines {
            writeln!(encoder, "{line}").context("append line to monthly archive")?;
        }
        encoder.finish().context("finalize monthly archive")?;
        archived += lines.len();
    }

    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = File::create(&tmp).context("create trimmed log temp file")?;
        for line in keep_lines {
            writeln!(out, "{line}").context("write trimmed log line")?;
        }
        out.sync_all().context("sync trimmed log file")?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        if path.exists() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).context("replace trimmed log file")?;
        } else {
            return Err(err).context("rename trimmed log file");
        }
    }
    Ok(archived)
}

/// Keeps everything in memory; used by tests and dry runs.
#[derive(Default)]
pub struct MemoryCausalLog {
    edges: Mutex<Vec<CausalEdge>>,
    summaries: Mutex<Vec<CycleSummary>>,
}

impl MemoryCausalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edges(&self) -> Vec<CausalEdge> {
        self.edges.lock().clone()
    }

    pub fn summaries(&self) -> Vec<CycleSummary> {
        self.summaries.lock().clone()
    }
}

impl CausalSink for MemoryCausalLog {
    fn append_edges(&self, edges: &[CausalEdge]) -> Result<()> {
        self.edges.lock().extend_from_slice(edges);
        Ok(())
    }

    fn append_summary(&self, summary: &CycleSummary) -> Result<()> {
        self.summaries.lock().push(summary.clone());
        Ok(())
    }

    fn latest_summary(&self) -> Result<Option<CycleSummary>> {
        Ok(self.summaries.lock().last().cloned())
    }

    fn history(&self, limit: usize) -> Result<Vec<CycleSummary>> {
        let rows = self.summaries.lock();
        let start = rows.len().saturating_sub(limit);
        Ok(rows[start..].to_vec())
    }
}
