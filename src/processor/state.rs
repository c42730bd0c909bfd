//! Run bookkeeping shared between the dispatcher (sole writer) and observers.

use crate::runtime::progress::{ProgressUpdate, RunStatus};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Running,
    Completed,
}

impl RunPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunPhase::Idle,
            1 => RunPhase::Running,
            _ => RunPhase::Completed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunPhase::Idle => 0,
            RunPhase::Running => 1,
            RunPhase::Completed => 2,
        }
    }
}

/// Counters for one run.
///
/// Only the dispatcher task mutates these. They are atomics so that handles and the
/// metrics reporter on other threads can read consistent-enough snapshots.
#[derive(Debug)]
pub struct RunState {
    total: usize,
    next_index: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    timed_out: AtomicUsize,
    skipped: AtomicUsize,
    peak_in_flight: AtomicUsize,
    phase: AtomicU8,
}

impl RunState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            next_index: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            timed_out: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            phase: AtomicU8::new(RunPhase::Idle.as_u8()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn mark_running(&self) {
        let _ = self.phase.compare_exchange(
            RunPhase::Idle.as_u8(),
            RunPhase::Running.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn mark_completed(&self) {
        self.phase
            .store(RunPhase::Completed.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.next_index.load(Ordering::SeqCst) < self.total
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claims the next admission slot and returns the index of the admitted item.
    pub(crate) fn admit(&self) -> usize {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        debug_assert!(index < self.total, "admitted past the end of the run");
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        index
    }

    pub(crate) fn record_completion(&self, failed: bool, timed_out: bool) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "completion without a matching admission");
        self.completed.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
        debug_assert!(self.snapshot().is_consistent());
    }

    /// Counts every unadmitted item as skipped and moves the cursor to the end.
    pub(crate) fn skip_remaining(&self) -> usize {
        let previous = self.next_index.swap(self.total, Ordering::SeqCst);
        let skipped = self.total.saturating_sub(previous);
        self.skipped.fetch_add(skipped, Ordering::SeqCst);
        skipped
    }

    pub fn snapshot(&self) -> RunStateSnapshot {
        RunStateSnapshot {
            total: self.total,
            next_index: self.next_index.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            phase: self.phase(),
        }
    }

    pub(crate) fn progress(&self, status: RunStatus) -> ProgressUpdate {
        let snapshot = self.snapshot();
        ProgressUpdate {
            completed: snapshot.completed,
            total: snapshot.total,
            errors: snapshot.errors,
            in_flight: snapshot.in_flight,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStateSnapshot {
    pub total: usize,
    pub next_index: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub errors: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub peak_in_flight: usize,
    pub phase: RunPhase,
}

impl RunStateSnapshot {
    /// `completed + in_flight + skipped + unadmitted == total`.
    pub fn is_consistent(&self) -> bool {
        let unadmitted = self.total.saturating_sub(self.next_index);
        self.completed + self.in_flight + self.skipped + unadmitted == self.total
            && self.errors <= self.completed
    }

    pub fn is_terminal(&self) -> bool {
        self.next_index >= self.total && self.in_flight == 0
    }
}
