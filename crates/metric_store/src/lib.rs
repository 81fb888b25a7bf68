use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use core_types::{EntityId, MetricWindow, OutcomeFeed, OutcomeRecord, WindowKind};
use infra_clock::mins_to_ms;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    pub short_window_mins: u64,
    pub long_window_mins: u64,
    /// Upper bound on records scanned per cycle; the newest records win.
    pub max_scan_records: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            short_window_mins: 30,
            long_window_mins: 24 * 60,
            max_scan_records: 50_000,
        }
    }
}

impl WindowConfig {
    pub fn normalized(mut self) -> Self {
        self.short_window_mins = self.short_window_mins.max(1);
        self.long_window_mins = self.long_window_mins.max(self.short_window_mins);
        self.max_scan_records = self.max_scan_records.max(1);
        self
    }

    pub fn window_mins(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::Short => self.short_window_mins,
            WindowKind::Long => self.long_window_mins,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityWindows {
    pub short: MetricWindow,
    pub long: MetricWindow,
}

/// One read of the outcome feed, shared read-only by every entity evaluation in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub as_of_ms: i64,
    pub windows: BTreeMap<EntityId, EntityWindows>,
    pub scanned: usize,
    pub truncated: bool,
    short_window_mins: u64,
    long_window_mins: u64,
}

impl MetricSnapshot {
    /// Windows for `entity`, or empty (insufficient evidence) windows if the scan never saw it.
    pub fn windows_for(&self, entity: &EntityId) -> EntityWindows {
        self.windows.get(entity).cloned().unwrap_or_else(|| EntityWindows {
            short: MetricWindow::empty(
                entity.clone(),
                WindowKind::Short,
                self.short_window_mins,
                self.as_of_ms,
            ),
            long: MetricWindow::empty(
                entity.clone(),
                WindowKind::Long,
                self.long_window_mins,
                self.as_of_ms,
            ),
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.windows.keys()
    }
}

pub struct MetricStore {
    feed: Arc<dyn OutcomeFeed>,
    cfg: WindowConfig,
}

impl MetricStore {
    pub fn new(feed: Arc<dyn OutcomeFeed>, cfg: WindowConfig) -> Self {
        Self {
            feed,
            cfg: cfg.normalized(),
        }
    }

    pub fn cfg(&self) -> &WindowConfig {
        &self.cfg
    }

    pub fn aggregate(
        &self,
        entity: &EntityId,
        kind: WindowKind,
        as_of_ms: i64,
    ) -> Result<MetricWindow> {
        self.aggregate_window(entity, kind, self.cfg.window_mins(kind), as_of_ms)
    }

    pub fn aggregate_window(
        &self,
        entity: &EntityId,
        kind: WindowKind,
        window_mins: u64,
        as_of_ms: i64,
    ) -> Result<MetricWindow> {
        let from_ms = as_of_ms.saturating_sub(mins_to_ms(window_mins));
        let records = self
            .feed
            .outcomes_between(from_ms, as_of_ms, self.cfg.max_scan_records)
            .with_context(|| format!("read outcome feed for {entity}"))?;
        Ok(aggregate_records(&records, entity, kind, window_mins, as_of_ms))
    }

    pub fn snapshot(&self, as_of_ms: i64) -> Result<MetricSnapshot> {
        let from_ms = as_of_ms.saturating_sub(mins_to_ms(self.cfg.long_window_mins));
        let records = self
            .feed
            .outcomes_between(from_ms, as_of_ms, self.cfg.max_scan_records)
            .context("read outcome feed")?;
        let scanned = records.len();
        let truncated = scanned >= self.cfg.max_scan_records;
        if truncated {
            tracing::warn!(
                scanned,
                max = self.cfg.max_scan_records,
                "outcome scan hit the record cap; long window is truncated"
            );
        }

        let mut grouped = BTreeMap::<EntityId, Vec<OutcomeRecord>>::new();
        for record in records {
            grouped.entry(record.entity.clone()).or_default().push(record);
        }
        let windows = grouped
            .into_iter()
            .map(|(entity, rows)| {
                let short = aggregate_records(
                    &rows,
                    &entity,
                    WindowKind::Short,
                    self.cfg.short_window_mins,
                    as_of_ms,
                );
                let long = aggregate_records(
                    &rows,
                    &entity,
                    WindowKind::Long,
                    self.cfg.long_window_mins,
                    as_of_ms,
                );
                (entity, EntityWindows { short, long })
            })
            .collect();

        Ok(MetricSnapshot {
            as_of_ms,
            windows,
            scanned,
            truncated,
            short_window_mins: self.cfg.short_window_mins,
            long_window_mins: self.cfg.long_window_mins,
        })
    }
}

/// Aggregate `(as_of - window, as_of]` for one entity. Non-finite returns are skipped.
pub fn aggregate_records(
    records: &[OutcomeRecord],
    entity: &EntityId,
    kind: WindowKind,
    window_mins: u64,
    as_of_ms: i64,
) -> MetricWindow {
    let from_ms = as_of_ms.saturating_sub(mins_to_ms(window_mins));
    let mut sum = 0.0;
    let mut count = 0_u64;
    let mut wins = 0_u64;
    for record in records {
        if &record.entity != entity
            || record.ts_ms <= from_ms
            || record.ts_ms > as_of_ms
            || !record.realized_return.is_finite()
        {
            continue;
        }
        sum += record.realized_return;
        count += 1;
        if record.realized_return > 0.0 {
            wins += 1;
        }
    }
    if count == 0 {
        return MetricWindow::empty(entity.clone(), kind, window_mins, as_of_ms);
    }
    MetricWindow {
        entity: entity.clone(),
        kind,
        window_mins,
        avg_return: sum / count as f64,
        sample_count: count,
        win_count: wins,
        as_of_ms,
    }
}
