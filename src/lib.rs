pub mod processor;
pub mod remote;
pub mod runtime;
pub mod work;

pub use processor::dispatcher::RunSummary;
pub use processor::state::{RunPhase, RunStateSnapshot};
pub use remote::{HttpActionWorker, RemoteAction, RemoteOptions};
pub use runtime::config::{RunnerConfig, RunnerConfigBuilder, RunnerConfigParams, RunnerError};
pub use runtime::progress::{LoggingSink, ProgressSink, ProgressTracker, ProgressUpdate, RunStatus};
pub use runtime::runner::{RunHandle, TaskRunner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use work::{unclaimed, ClaimGuard, FnWorker, Outcome, WorkError, WorkFuture, WorkItem, Worker};
