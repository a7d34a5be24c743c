//! Thread-safe run progress counters.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub completed: usize,
    pub stuck: usize,
    pub skipped: usize,
    pub total: usize,
}

impl PoolSnapshot {
    pub fn processed(&self) -> usize {
        self.completed + self.stuck + self.skipped
    }
}

/// Progress counters for a run. Counters only ever grow; their sum never
/// exceeds the total.
pub struct ExecutionPool {
    total: usize,
    counts: Mutex<(usize, usize, usize)>,
}

impl ExecutionPool {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            counts: Mutex::new((0, 0, 0)),
        }
    }

    pub fn record_completed(&self) {
        self.lock().0 += 1;
    }

    pub fn record_stuck(&self) {
        self.lock().1 += 1;
    }

    pub fn record_skipped(&self) {
        self.lock().2 += 1;
    }

    /// Restore counters from a checkpoint.
    pub fn restore(&self, completed: usize, stuck: usize, skipped: usize) {
        let mut counts = self.lock();
        *counts = (completed, stuck, skipped);
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot().processed() >= self.total
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let (completed, stuck, skipped) = *self.lock();
        PoolSnapshot {
            completed,
            stuck,
            skipped,
            total: self.total,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (usize, usize, usize)> {
        self.counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
