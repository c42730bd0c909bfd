//! Progress updates emitted by the runner and the stock sinks that consume them.

use std::sync::Mutex;
use tokio::sync::watch;

/// Where a run stands at the time an update was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    /// Nothing was admissible; reported once instead of a normal completion.
    Empty,
    Cancelled,
}

impl RunStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Aggregate snapshot handed to a [`ProgressSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub completed: usize,
    pub total: usize,
    pub errors: usize,
    pub in_flight: usize,
    pub status: RunStatus,
}

impl ProgressUpdate {
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    pub fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.errors)
    }

    /// Rounded completion percentage. An empty run reports a full bar.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let pct = (self.completed as f64 / self.total as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }
}

/// Observer of run progress.
///
/// Called from the dispatcher task; implementations must return promptly and must
/// tolerate receiving the same update more than once.
pub trait ProgressSink: Send + Sync + 'static {
    fn notify(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync + 'static,
{
    fn notify(&self, update: &ProgressUpdate) {
        self(update)
    }
}

/// Keeps the most recent update in a watch channel so any number of tasks can follow a run.
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<Option<ProgressUpdate>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn latest(&self) -> Option<ProgressUpdate> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressUpdate>> {
        self.tx.subscribe()
    }

    /// Resolves with the terminal update once the run has produced one.
    pub async fn wait_final(&self) -> ProgressUpdate {
        let mut rx = self.subscribe();
        loop {
            if let Some(update) = *rx.borrow_and_update() {
                if update.is_final() {
                    return update;
                }
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this only happens during teardown.
                if let Some(update) = *rx.borrow() {
                    return update;
                }
            }
        }
    }
}

impl ProgressSink for ProgressTracker {
    fn notify(&self, update: &ProgressUpdate) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(update) {
                return false;
            }
            *current = Some(*update);
            true
        });
    }
}

/// Logs progress through `tracing`, skipping exact repeats.
#[derive(Debug, Default)]
pub struct LoggingSink {
    last: Mutex<Option<ProgressUpdate>>,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for LoggingSink {
    fn notify(&self, update: &ProgressUpdate) {
        {
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.as_ref() == Some(update) {
                return;
            }
            *last = Some(*update);
        }

        match update.status {
            RunStatus::Running => tracing::debug!(
                target: "bulkrun::progress",
                completed = update.completed,
                total = update.total,
                errors = update.errors,
                in_flight = update.in_flight,
                percent = update.percent(),
                "processed {} of {}",
                update.completed,
                update.total
            ),
            RunStatus::Completed => tracing::info!(
                target: "bulkrun::progress",
                completed = update.completed,
                total = update.total,
                errors = update.errors,
                "completed {} of {}",
                update.completed,
                update.total
            ),
            RunStatus::Empty => {
                tracing::warn!(target: "bulkrun::progress", "no items to process")
            }
            RunStatus::Cancelled => tracing::warn!(
                target: "bulkrun::progress",
                completed = update.completed,
                total = update.total,
                errors = update.errors,
                "run cancelled after {} of {}",
                update.completed,
                update.total
            ),
        }
    }
}
