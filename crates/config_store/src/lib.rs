use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use core_types::{EntityId, EntityLedger, GovernanceError, ParameterRef, ParameterState, TwinState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STATE_FILE_NAME: &str = "governance_state.json";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unreadable at {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("store corrupt at {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("document version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },
    #[error("revision conflict on {parameter}: expected {expected}, found {found}")]
    ParameterConflict {
        parameter: String,
        expected: u64,
        found: u64,
    },
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    #[error(transparent)]
    Invalid(#[from] GovernanceError),
    #[error("store write failed: {0}")]
    Write(String),
}

impl StoreError {
    /// Unreadable or corrupt state aborts a cycle before evaluation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unreadable { .. } | Self::Corrupt { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::ParameterConflict { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredParameter {
    pub state: ParameterState,
    /// Bumped on every committed value change; used for per-parameter compare-and-swap.
    pub revision: u64,
}

impl StoredParameter {
    pub fn new(state: ParameterState) -> Self {
        Self { state, revision: 0 }
    }

    pub fn set_value(&mut self, value: f64, now_ms: i64) {
        self.state.value = value;
        self.state.updated_at_ms = now_ms;
        self.revision = self.revision.saturating_add(1);
    }
}

/// Whole persisted control state. Written only as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GovernanceDocument {
    pub version: u64,
    #[serde(default)]
    pub cycle_seq: u64,
    #[serde(default)]
    pub parameters: BTreeMap<ParameterRef, StoredParameter>,
    #[serde(default)]
    pub entities: BTreeMap<EntityId, EntityLedger>,
    #[serde(default)]
    pub twin: TwinState,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl GovernanceDocument {
    pub fn validate(&self) -> Result<(), GovernanceError> {
        for (pref, stored) in &self.parameters {
            stored.state.validate(&pref.to_string())?;
        }
        Ok(())
    }

    pub fn parameters_of<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> impl Iterator<Item = (&'a ParameterRef, &'a StoredParameter)> + 'a {
        self.parameters
            .iter()
            .filter(move |(pref, _)| &pref.entity == entity)
    }

    /// Ledger for `entity`, created on first reference.
    pub fn ledger_mut(&mut self, entity: &EntityId, now_ms: i64) -> &mut EntityLedger {
        self.entities.entry(entity.clone()).or_insert_with(|| EntityLedger {
            first_seen_ms: now_ms,
            ..EntityLedger::default()
        })
    }

    /// Seed a parameter if absent. Returns true when it was inserted.
    pub fn register_parameter(
        &mut self,
        pref: ParameterRef,
        state: ParameterState,
        now_ms: i64,
    ) -> Result<bool, GovernanceError> {
        state.validate(&pref.to_string())?;
        if self.parameters.contains_key(&pref) {
            return Ok(false);
        }
        self.ledger_mut(&pref.entity, now_ms);
        self.parameters.insert(pref, StoredParameter::new(state));
        Ok(true)
    }
}

pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<GovernanceDocument, StoreError>;

    /// Persist `doc` if the stored version still equals `expected_version`.
    /// Returns the new version.
    fn store(&self, doc: &GovernanceDocument, expected_version: u64) -> Result<u64, StoreError>;

    fn get_parameter(&self, pref: &ParameterRef) -> Result<Option<StoredParameter>, StoreError> {
        Ok(self.load()?.parameters.get(pref).cloned())
    }

    fn compare_and_swap_parameter(
        &self,
        pref: &ParameterRef,
        expected_revision: u64,
        next: ParameterState,
    ) -> Result<u64, StoreError> {
        next.validate(&pref.to_string())?;
        let (doc, _) = update_with_retry(self, DEFAULT_MAX_ATTEMPTS, |doc| {
            let stored = doc
                .parameters
                .get_mut(pref)
                .ok_or_else(|| StoreError::UnknownParameter(pref.to_string()))?;
            if stored.revision != expected_revision {
                return Err(StoreError::ParameterConflict {
                    parameter: pref.to_string(),
                    expected: expected_revision,
                    found: stored.revision,
                });
            }
            stored.state = next.clone();
            stored.revision = stored.revision.saturating_add(1);
            Ok(())
        })?;
        doc.parameters
            .get(pref)
            .map(|p| p.revision)
            .ok_or_else(|| StoreError::UnknownParameter(pref.to_string()))
    }
}

/// Load, mutate, compare-and-swap. A document-level conflict re-reads the whole
/// document and re-runs `mutate` on the fresh copy, up to `max_attempts` times.
pub fn update_with_retry<S, F>(
    store: &S,
    max_attempts: u32,
    mut mutate: F,
) -> Result<(GovernanceDocument, u32), StoreError>
where
    S: ConfigStore + ?Sized,
    F: FnMut(&mut GovernanceDocument) -> Result<(), StoreError>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut doc = store.load()?;
        let expected = doc.version;
        mutate(&mut doc)?;
        match store.store(&doc, expected) {
            Ok(version) => {
                doc.version = version;
                return Ok((doc, attempt));
            }
            Err(err @ StoreError::Conflict { .. }) if attempt < max_attempts => {
                tracing::warn!(attempt, error = %err, "config store conflict; re-reading");
            }
            Err(err) => return Err(err),
        }
    }
}

/// JSON file store. Writes go to a temp file, are fsynced and then renamed over the target.
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    fn read_document(&self) -> Result<GovernanceDocument, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(GovernanceDocument::default());
            }
            Err(err) => {
                return Err(StoreError::Unreadable {
                    path: self.path_str(),
                    reason: err.to_string(),
                })
            }
        };
        let doc = serde_json::from_str::<GovernanceDocument>(&raw).map_err(|err| {
            StoreError::Corrupt {
                path: self.path_str(),
                reason: err.to_string(),
            }
        })?;
        doc.validate().map_err(|err| StoreError::Corrupt {
            path: self.path_str(),
            reason: err.to_string(),
        })?;
        Ok(doc)
    }

    fn write_atomic(&self, doc: &GovernanceDocument) -> Result<(), StoreError> {
        let write_err = |what: &str, err: std::io::Error| StoreError::Write(format!("{what}: {err}"));
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_err("create state dir", e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(doc)
            .map_err(|e| StoreError::Write(format!("serialize governance state: {e}")))?;
        {
            let mut file = File::create(&tmp).map_err(|e| write_err("create state tmp", e))?;
            file.write_all(&payload)
                .map_err(|e| write_err("write state tmp", e))?;
            file.sync_all().map_err(|e| write_err("sync state tmp", e))?;
        }
        if let Err(err) = fs::rename(&tmp, &self.path) {
            if self.path.exists() {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp, &self.path).map_err(|e| write_err("replace state file", e))?;
            } else {
                return Err(write_err("rename state tmp", err));
            }
        }
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<GovernanceDocument, StoreError> {
        self.read_document()
    }

    fn store(&self, doc: &GovernanceDocument, expected_version: u64) -> Result<u64, StoreError> {
        doc.validate()?;
        let _guard = self.write_lock.lock();
        let found = self.read_document()?.version;
        if found != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found,
            });
        }
        let mut next = doc.clone();
        next.version = expected_version.saturating_add(1);
        self.write_atomic(&next)?;
        Ok(next.version)
    }
}

type StoreHook = Box<dyn FnOnce(&mut GovernanceDocument) + Send>;

/// In-memory store with hooks for simulating concurrent writers and broken state.
#[derive(Default)]
pub struct MemoryConfigStore {
    doc: Mutex<GovernanceDocument>,
    before_store: Mutex<Vec<StoreHook>>,
    corrupt: Mutex<Option<String>>,
    writes: Mutex<u64>,
}

impl MemoryConfigStore {
    pub fn new(doc: GovernanceDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
            ..Self::default()
        }
    }

    /// Run `hook` against the stored document just before the next `store` compares
    /// versions. The hook's change bumps the version like any other writer.
    pub fn on_next_store(&self, hook: impl FnOnce(&mut GovernanceDocument) + Send + 'static) {
        self.before_store.lock().push(Box::new(hook));
    }

    pub fn set_corrupt(&self, reason: Option<&str>) {
        *self.corrupt.lock() = reason.map(str::to_string);
    }

    pub fn snapshot(&self) -> GovernanceDocument {
        self.doc.lock().clone()
    }

    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<GovernanceDocument, StoreError> {
        if let Some(reason) = self.corrupt.lock().clone() {
            return Err(StoreError::Corrupt {
                path: "memory".to_string(),
                reason,
            });
        }
        Ok(self.doc.lock().clone())
    }

    fn store(&self, doc: &GovernanceDocument, expected_version: u64) -> Result<u64, StoreError> {
        doc.validate()?;
        let hook = {
            let mut hooks = self.before_store.lock();
            if hooks.is_empty() {
                None
            } else {
                Some(hooks.remove(0))
            }
        };
        let mut current = self.doc.lock();
        if let Some(hook) = hook {
            hook(&mut current);
            current.version = current.version.saturating_add(1);
        }
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found: current.version,
            });
        }
        let mut next = doc.clone();
        next.version = expected_version.saturating_add(1);
        *current = next;
        *self.writes.lock() += 1;
        Ok(current.version)
    }
}
