use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for replays and tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set_ms(&self, ts_ms: i64) {
        self.now_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn advance_ms(&self, delta_ms: i64) -> i64 {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed) + delta_ms
    }

    pub fn advance_mins(&self, mins: u64) -> i64 {
        self.advance_ms((mins as i64).saturating_mul(60_000))
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// Wall-time budget for the data-acquisition phase of a cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleBudget {
    started: Instant,
    budget: Duration,
}

impl CycleBudget {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn exceeded(&self) -> bool {
        !self.budget.is_zero() && self.elapsed() > self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }
}

pub fn mins_to_ms(mins: u64) -> i64 {
    (mins as i64).saturating_mul(60_000)
}
