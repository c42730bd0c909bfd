use crate::processor::dispatcher::{Dispatcher, DispatcherParams, RunSummary};
use crate::processor::state::{RunPhase, RunState, RunStateSnapshot};
use crate::runtime::config::{RunnerConfig, RunnerError};
use crate::runtime::progress::ProgressSink;
use crate::runtime::telemetry::{self, Telemetry};
use crate::work::Worker;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs a fixed, ordered batch of work items through a worker under a concurrency cap.
///
/// A runner executes exactly once: [`TaskRunner::start`] consumes it, so a new batch
/// needs a new instance.
pub struct TaskRunner<W: Worker> {
    config: RunnerConfig,
    worker: Arc<W>,
    items: Vec<W::Item>,
    sink: Arc<dyn ProgressSink>,
    telemetry: Arc<Telemetry>,
    state: Arc<RunState>,
    shutdown: CancellationToken,
}

impl<W: Worker> TaskRunner<W> {
    /// Builds a runner over `items`, which the caller has already filtered down to
    /// admissible (unclaimed) entries.
    pub fn new<S: ProgressSink>(
        config: RunnerConfig,
        items: Vec<W::Item>,
        worker: W,
        sink: Arc<S>,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        let state = Arc::new(RunState::new(items.len()));
        Ok(Self {
            config,
            worker: Arc::new(worker),
            items,
            sink,
            telemetry: Arc::new(Telemetry::default()),
            state,
            shutdown: CancellationToken::new(),
        })
    }

    /// Shorthand for a runner with default settings apart from the concurrency limit.
    pub fn with_concurrency<S: ProgressSink>(
        concurrency_limit: usize,
        items: Vec<W::Item>,
        worker: W,
        sink: Arc<S>,
    ) -> Result<Self, RunnerError> {
        let config = RunnerConfig::builder()
            .concurrency_limit(concurrency_limit)
            .build()?;
        Self::new(config, items, worker, sink)
    }

    /// Returns a clone of the run's cancellation token. Cancelling it stops admission;
    /// items already in flight are allowed to finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn total(&self) -> usize {
        self.state.total()
    }

    /// Spawns the dispatcher onto the current tokio runtime and returns immediately.
    pub fn start(self) -> RunHandle {
        let run_token = self.shutdown.child_token();
        let metrics_token = CancellationToken::new();
        let metrics_handle = telemetry::spawn_metrics_reporter(
            self.telemetry.clone(),
            metrics_token.clone(),
            self.config.metrics_interval(),
        );

        let dispatcher = Dispatcher::new(DispatcherParams {
            worker: self.worker,
            items: self.items,
            state: self.state.clone(),
            sink: self.sink,
            telemetry: self.telemetry.clone(),
            concurrency_limit: self.config.concurrency_limit(),
            item_timeout: self.config.item_timeout(),
            cancellation: run_token,
        });

        let dispatch_handle = tokio::spawn(async move {
            let summary = dispatcher.run().await;
            metrics_token.cancel();
            summary
        });

        RunHandle {
            state: self.state,
            telemetry: self.telemetry,
            shutdown: self.shutdown,
            dispatch_handle,
            metrics_handle,
        }
    }

    /// Starts the run and waits for its terminal state.
    pub async fn run(self) -> Result<RunSummary> {
        self.start().join().await
    }

    /// Runs until every item finished, or until Ctrl-C (SIGINT) cancels the remainder.
    pub async fn run_until_ctrl_c(self) -> Result<RunSummary> {
        let handle = self.start();
        let shutdown = handle.shutdown.clone();
        tracing::info!("bulk run started; Ctrl-C cancels remaining items");

        let ctrl_c = tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("Ctrl-C received; cancelling bulk run");
                        shutdown.cancel();
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });

        let summary = handle.join().await;
        ctrl_c.abort();
        summary
    }
}

/// Observes and controls a started run.
pub struct RunHandle {
    state: Arc<RunState>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    dispatch_handle: JoinHandle<RunSummary>,
    metrics_handle: JoinHandle<()>,
}

impl RunHandle {
    pub fn phase(&self) -> RunPhase {
        self.state.phase()
    }

    pub fn snapshot(&self) -> RunStateSnapshot {
        self.state.snapshot()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops admitting new items; in-flight items still complete and are counted.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.dispatch_handle.is_finished()
    }

    /// Waits for the terminal state and returns the final tallies.
    pub async fn join(self) -> Result<RunSummary> {
        let summary = self
            .dispatch_handle
            .await
            .context("bulk run dispatcher task failed")?;
        if let Err(err) = self.metrics_handle.await {
            tracing::warn!(error = %err, "metrics reporter task failed");
        }
        Ok(summary)
    }
}
