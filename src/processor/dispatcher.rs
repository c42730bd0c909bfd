//! Admission loop driving a run to its terminal state.
//!
//! The dispatcher is the only writer of [`RunState`]. In-flight items live in a
//! `JoinSet` whose length never exceeds the concurrency limit; every time a slot
//! frees the loop refills as many slots as it can, in input order.

use crate::processor::state::{RunState, RunStateSnapshot};
use crate::runtime::progress::{ProgressSink, ProgressUpdate, RunStatus};
use crate::runtime::telemetry::Telemetry;
use crate::work::{Outcome, WorkFuture, Worker};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionKind {
    Finished,
    Errored,
    TimedOut,
    Panicked,
}

#[derive(Debug)]
struct Completion {
    index: usize,
    outcome: Outcome,
    kind: CompletionKind,
}

/// Final tallies of a run, with per-item outcomes indexed by input position.
///
/// Items never admitted (cancelled runs) have no outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub peak_in_flight: usize,
    pub outcomes: Vec<Option<Outcome>>,
}

impl RunSummary {
    fn from_state(status: RunStatus, snapshot: RunStateSnapshot, outcomes: Vec<Option<Outcome>>) -> Self {
        Self {
            status,
            total: snapshot.total,
            completed: snapshot.completed,
            errors: snapshot.errors,
            timed_out: snapshot.timed_out,
            skipped: snapshot.skipped,
            peak_in_flight: snapshot.peak_in_flight,
            outcomes,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.errors)
    }

    /// Input positions whose item failed, in input order.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| match outcome {
                Some(Outcome::Failure { .. }) => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn final_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            completed: self.completed,
            total: self.total,
            errors: self.errors,
            in_flight: 0,
            status: self.status,
        }
    }
}

pub(crate) struct DispatcherParams<W: Worker> {
    pub worker: Arc<W>,
    pub items: Vec<W::Item>,
    pub state: Arc<RunState>,
    pub sink: Arc<dyn ProgressSink>,
    pub telemetry: Arc<Telemetry>,
    pub concurrency_limit: usize,
    pub item_timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

pub(crate) struct Dispatcher<W: Worker> {
    worker: Arc<W>,
    items: std::vec::IntoIter<W::Item>,
    state: Arc<RunState>,
    sink: Arc<dyn ProgressSink>,
    telemetry: Arc<Telemetry>,
    concurrency_limit: usize,
    item_timeout: Option<Duration>,
    cancellation: CancellationToken,
    in_flight: JoinSet<Completion>,
    task_index: HashMap<TaskId, usize>,
    outcomes: Vec<Option<Outcome>>,
}

impl<W: Worker> Dispatcher<W> {
    pub(crate) fn new(params: DispatcherParams<W>) -> Self {
        let total = params.items.len();
        debug_assert_eq!(total, params.state.total());
        debug_assert!(params.concurrency_limit >= 1, "concurrency limit is validated upstream");
        Self {
            worker: params.worker,
            items: params.items.into_iter(),
            state: params.state,
            sink: params.sink,
            telemetry: params.telemetry,
            concurrency_limit: params.concurrency_limit,
            item_timeout: params.item_timeout,
            cancellation: params.cancellation,
            in_flight: JoinSet::new(),
            task_index: HashMap::new(),
            outcomes: vec![None; total],
        }
    }

    pub(crate) async fn run(mut self) -> RunSummary {
        self.state.mark_running();

        if self.state.total() == 0 {
            tracing::info!("no items to process");
            return self.finish(RunStatus::Empty);
        }

        tracing::info!(
            total = self.state.total(),
            concurrency_limit = self.concurrency_limit,
            item_timeout = ?self.item_timeout,
            "bulk run started"
        );
        self.notify(RunStatus::Running);

        let mut cancelled = false;
        loop {
            if !cancelled && self.cancellation.is_cancelled() {
                cancelled = true;
                let skipped = self.state.skip_remaining();
                tracing::warn!(
                    skipped,
                    in_flight = self.in_flight.len(),
                    "run cancelled; draining in-flight items"
                );
            }

            if !cancelled {
                self.fill_slots();
            }

            if self.in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = self.cancellation.cancelled(), if !cancelled => continue,
                joined = self.in_flight.join_next_with_id() => joined,
            };

            match joined {
                Some(Ok((id, completion))) => {
                    self.task_index.remove(&id);
                    self.record(completion);
                }
                Some(Err(err)) => {
                    let index = self.task_index.remove(&err.id());
                    tracing::error!(?index, error = %err, "item task was lost");
                    if let Some(index) = index {
                        self.record(Completion {
                            index,
                            outcome: Outcome::failure(format!("item task was lost: {err}")),
                            kind: CompletionKind::Panicked,
                        });
                    }
                }
                None => break,
            }
        }

        let status = if self.state.snapshot().skipped > 0 {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        self.finish(status)
    }

    fn fill_slots(&mut self) {
        while self.in_flight.len() < self.concurrency_limit && self.state.has_pending() {
            let Some(item) = self.items.next() else {
                break;
            };
            let index = self.state.admit();
            self.telemetry.record_admitted(self.state.in_flight());
            tracing::trace!(index, in_flight = self.state.in_flight(), "item admitted");

            let worker = Arc::clone(&self.worker);
            let future = std::panic::catch_unwind(AssertUnwindSafe(move || worker.perform(item)));
            let handle = match future {
                Ok(future) => self
                    .in_flight
                    .spawn(execute_item(index, future, self.item_timeout)),
                Err(panic) => {
                    let outcome =
                        Outcome::failure(format!("worker panicked: {}", panic_message(panic.as_ref())));
                    self.in_flight.spawn(async move {
                        Completion {
                            index,
                            outcome,
                            kind: CompletionKind::Panicked,
                        }
                    })
                }
            };
            self.task_index.insert(handle.id(), index);
        }
    }

    fn record(&mut self, completion: Completion) {
        let Completion {
            index,
            outcome,
            kind,
        } = completion;
        let failed = !outcome.is_success();

        self.state
            .record_completion(failed, kind == CompletionKind::TimedOut);
        match kind {
            CompletionKind::Finished if !failed => self.telemetry.record_success(),
            CompletionKind::Finished | CompletionKind::Errored => self.telemetry.record_failure(),
            CompletionKind::TimedOut => self.telemetry.record_timeout(),
            CompletionKind::Panicked => self.telemetry.record_panic(),
        }

        if let Outcome::Failure { reason } = &outcome {
            tracing::warn!(index, kind = ?kind, reason = %reason, "item failed");
        } else {
            tracing::debug!(index, "item succeeded");
        }

        if let Some(slot) = self.outcomes.get_mut(index) {
            *slot = Some(outcome);
        }
        self.notify(RunStatus::Running);
    }

    fn notify(&self, status: RunStatus) {
        self.sink.notify(&self.state.progress(status));
    }

    fn finish(self, status: RunStatus) -> RunSummary {
        self.state.mark_completed();
        let snapshot = self.state.snapshot();
        debug_assert!(snapshot.is_terminal() && snapshot.is_consistent());
        self.notify(status);

        tracing::info!(
            status = ?status,
            total = snapshot.total,
            completed = snapshot.completed,
            errors = snapshot.errors,
            skipped = snapshot.skipped,
            "bulk run finished"
        );

        RunSummary::from_state(status, snapshot, self.outcomes)
    }
}

async fn execute_item(index: usize, future: WorkFuture, timeout: Option<Duration>) -> Completion {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                return Completion {
                    index,
                    outcome: Outcome::failure(format!("timed out after {limit:?}")),
                    kind: CompletionKind::TimedOut,
                };
            }
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(outcome)) => Completion {
            index,
            outcome,
            kind: CompletionKind::Finished,
        },
        Ok(Err(err)) => Completion {
            index,
            outcome: Outcome::failure(err.to_string()),
            kind: CompletionKind::Errored,
        },
        Err(panic) => Completion {
            index,
            outcome: Outcome::failure(format!(
                "worker panicked: {}",
                panic_message(panic.as_ref())
            )),
            kind: CompletionKind::Panicked,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
