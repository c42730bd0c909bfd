//! Work items, outcomes, and the `Worker` trait implemented by callers to
//! perform one remote operation per item.

use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type WorkFuture = Pin<Box<dyn Future<Output = Result<Outcome, WorkError>> + Send + 'static>>;

/// One independently executable unit of remote work.
///
/// The claim flag is shared between clones so the caller can hand the runner
/// a copy while keeping its own view of which items are taken.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    id: String,
    payload: T,
    claimed: Arc<AtomicBool>,
}

impl<T> WorkItem<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Marks the item as claimed. Returns `false` if someone else already holds it.
    pub fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    /// Returns the item to the re-triable state.
    pub fn release(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }

    /// Claims the item for one attempt. `None` if it is already claimed.
    ///
    /// The claim is released when the guard drops without [`ClaimGuard::commit`],
    /// which also covers an attempt whose future is dropped mid-flight (timeout).
    pub fn try_claim(&self) -> Option<ClaimGuard<'_, T>> {
        self.claim().then_some(ClaimGuard {
            item: self,
            committed: false,
        })
    }
}

/// Scoped claim on a [`WorkItem`]; see [`WorkItem::try_claim`].
#[must_use = "dropping the guard releases the claim immediately"]
pub struct ClaimGuard<'a, T> {
    item: &'a WorkItem<T>,
    committed: bool,
}

impl<T> ClaimGuard<'_, T> {
    /// Keeps the item claimed after the guard drops.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<T> Drop for ClaimGuard<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.item.release();
        }
    }
}

/// Keeps only the items nobody has claimed yet, preserving order.
///
/// The runner never filters its input; callers run this before construction.
pub fn unclaimed<T, I>(items: I) -> Vec<WorkItem<T>>
where
    I: IntoIterator<Item = WorkItem<T>>,
{
    items.into_iter().filter(|item| !item.is_claimed()).collect()
}

/// Result of a single work unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::failure("worker reported failure")
        }
    }
}

/// Error surfaced by a worker. Always recorded as a failed item, never fatal to the run.
#[derive(Debug)]
pub struct WorkError {
    source: AnyError,
}

impl WorkError {
    pub fn new(source: AnyError) -> Self {
        Self { source }
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl From<AnyError> for WorkError {
    fn from(source: AnyError) -> Self {
        Self::new(source)
    }
}

impl core::fmt::Display for WorkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "work item failed: {:#}", self.source)
    }
}

impl std::error::Error for WorkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Implemented by callers to perform the remote operation behind each item.
pub trait Worker: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Runs one item. The returned future is spawned, so it must own everything it needs.
    fn perform(&self, item: Self::Item) -> WorkFuture;
}

/// Adapts a closure returning a future into a [`Worker`].
pub struct FnWorker<I, F> {
    func: F,
    _item: core::marker::PhantomData<fn(I)>,
}

impl<I, F, Fut> FnWorker<I, F>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, WorkError>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _item: core::marker::PhantomData,
        }
    }
}

impl<I, F, Fut> Worker for FnWorker<I, F>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, WorkError>> + Send + 'static,
{
    type Item = I;

    fn perform(&self, item: Self::Item) -> WorkFuture {
        Box::pin((self.func)(item))
    }
}
