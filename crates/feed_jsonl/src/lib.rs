use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use core_types::{
    InterventionEvent, InterventionFeed, OutcomeFeed, OutcomeRecord, RiskSnapshot, RiskSource,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const OUTCOMES_FILE_NAME: &str = "outcomes.jsonl";
pub const INTERVENTIONS_FILE_NAME: &str = "interventions.jsonl";
pub const RISK_FILE_NAME: &str = "risk_snapshots.jsonl";

/// Append-only JSONL writer, one serialized record per line.
pub struct JsonlRecorder {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlRecorder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("create recorder dir")?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open recorder file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record).context("encode record")?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn write_all<T: Serialize>(&self, records: &[T]) -> Result<()> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record).context("encode record")?);
            buf.push('\n');
        }
        let mut file = self.file.lock();
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Stream every decodable line of `path` into `visit`. A missing file reads as empty;
/// undecodable lines are skipped with a warning so one torn write cannot stall the loop.
fn scan_records<T: DeserializeOwned>(path: &Path, mut visit: impl FnMut(T)) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("open feed file {}", path.display()))
        }
    };
    let mut skipped = 0_usize;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read feed file {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => visit(record),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "skipped undecodable feed lines");
    }
    Ok(())
}

fn push_capped<T>(dst: &mut VecDeque<T>, value: T, cap: usize) {
    dst.push_back(value);
    if cap > 0 && dst.len() > cap {
        dst.pop_front();
    }
}

/// Holds the last `cap` records offered (0 keeps all). Feeds are appended in time
/// order, so a capped read never buffers more than `cap` records of a long file.
struct NewestWindow<T> {
    kept: VecDeque<T>,
    cap: usize,
}

impl<T> NewestWindow<T> {
    fn new(cap: usize) -> Self {
        Self {
            kept: VecDeque::with_capacity(cap.min(4_096)),
            cap,
        }
    }

    fn offer(&mut self, record: T) {
        push_capped(&mut self.kept, record, self.cap);
    }

    /// Oldest first.
    fn into_sorted(self, ts: impl Fn(&T) -> i64) -> Vec<T> {
        let mut out = Vec::from(self.kept);
        out.sort_by_key(|r| ts(r));
        out
    }
}

pub struct JsonlOutcomeFeed {
    path: PathBuf,
}

impl JsonlOutcomeFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(OUTCOMES_FILE_NAME))
    }
}

impl OutcomeFeed for JsonlOutcomeFeed {
    fn outcomes_between(&self, from_ms: i64, to_ms: i64, max_records: usize) -> Result<Vec<OutcomeRecord>> {
        let mut window = NewestWindow::new(max_records);
        scan_records::<OutcomeRecord>(&self.path, |r| {
            if r.ts_ms > from_ms && r.ts_ms <= to_ms {
                window.offer(r);
            }
        })?;
        Ok(window.into_sorted(|r| r.ts_ms))
    }
}

pub struct JsonlInterventionFeed {
    path: PathBuf,
}

impl JsonlInterventionFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(INTERVENTIONS_FILE_NAME))
    }
}

impl InterventionFeed for JsonlInterventionFeed {
    fn interventions_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<InterventionEvent>> {
        let mut window = NewestWindow::new(0);
        scan_records::<InterventionEvent>(&self.path, |e| {
            if e.ts_ms >= from_ms && e.ts_ms <= to_ms {
                window.offer(e);
            }
        })?;
        Ok(window.into_sorted(|e| e.ts_ms))
    }
}

/// Latest line of a risk snapshot log. No snapshot is an error, never an empty portfolio.
pub struct JsonlRiskSource {
    path: PathBuf,
}

impl JsonlRiskSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(RISK_FILE_NAME))
    }
}

impl RiskSource for JsonlRiskSource {
    fn snapshot(&self) -> Result<RiskSnapshot> {
        let mut latest: Option<RiskSnapshot> = None;
        scan_records::<RiskSnapshot>(&self.path, |snap| {
            if latest.as_ref().map_or(true, |cur| snap.as_of_ms >= cur.as_of_ms) {
                latest = Some(snap);
            }
        })?;
        latest.ok_or_else(|| anyhow!("no risk snapshot in {}", self.path.display()))
    }
}

#[derive(Debug)]
struct MemoryFeedState<T> {
    records: Vec<T>,
    failure: Option<String>,
    latency: Duration,
}

impl<T> Default for MemoryFeedState<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            failure: None,
            latency: Duration::ZERO,
        }
    }
}

impl<T: Clone> MemoryFeedState<T> {
    fn read(&self) -> Result<Vec<T>> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        match &self.failure {
            Some(reason) => Err(anyhow!("{reason}")),
            None => Ok(self.records.clone()),
        }
    }
}

/// In-process outcome feed for replays and tests.
#[derive(Debug, Default)]
pub struct MemoryOutcomeFeed {
    state: Mutex<MemoryFeedState<OutcomeRecord>>,
}

impl MemoryOutcomeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: OutcomeRecord) {
        self.state.lock().records.push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = OutcomeRecord>) {
        self.state.lock().records.extend(records);
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        self.state.lock().failure = reason.map(str::to_string);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }
}

impl OutcomeFeed for MemoryOutcomeFeed {
    fn outcomes_between(&self, from_ms: i64, to_ms: i64, max_records: usize) -> Result<Vec<OutcomeRecord>> {
        let mut window = NewestWindow::new(max_records);
        for r in self.state.lock().read()? {
            if r.ts_ms > from_ms && r.ts_ms <= to_ms {
                window.offer(r);
            }
        }
        Ok(window.into_sorted(|r| r.ts_ms))
    }
}

#[derive(Debug, Default)]
pub struct MemoryInterventionFeed {
    state: Mutex<MemoryFeedState<InterventionEvent>>,
}

impl MemoryInterventionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: InterventionEvent) {
        self.state.lock().records.push(event);
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        self.state.lock().failure = reason.map(str::to_string);
    }
}

impl InterventionFeed for MemoryInterventionFeed {
    fn interventions_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<InterventionEvent>> {
        let mut events = self
            .state
            .lock()
            .read()?
            .into_iter()
            .filter(|e| e.ts_ms >= from_ms && e.ts_ms <= to_ms)
            .collect::<Vec<_>>();
        events.sort_by_key(|e| e.ts_ms);
        Ok(events)
    }
}

/// Risk source that returns whatever snapshot was last set.
#[derive(Debug, Default)]
pub struct StaticRiskSource {
    snapshot: Mutex<RiskSnapshot>,
    failure: Mutex<Option<String>>,
}

impl StaticRiskSource {
    pub fn new(snapshot: RiskSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            failure: Mutex::new(None),
        }
    }

    pub fn set(&self, snapshot: RiskSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn update(&self, f: impl FnOnce(&mut RiskSnapshot)) {
        f(&mut self.snapshot.lock());
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        *self.failure.lock() = reason.map(str::to_string);
    }
}

impl RiskSource for StaticRiskSource {
    fn snapshot(&self) -> Result<RiskSnapshot> {
        if let Some(reason) = self.failure.lock().as_ref() {
            return Err(anyhow!("{reason}"));
        }
        Ok(self.snapshot.lock().clone())
    }
}
