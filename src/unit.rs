//! Work units: the thing under test.
//!
//! A [`WorkUnit`] pairs a developer-supplied [`Job`] with identity,
//! lifecycle state, a cancellation token and, once finished, an
//! [`Outcome`]. Queues drive the lifecycle; tests observe it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Outcome, State, Transition, WorkId};
use crate::signal::Signal;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// How a job ends when it does not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job observed its cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

pub type JobResult = std::result::Result<Option<serde_json::Value>, JobError>;

/// The work logic a unit executes.
///
/// Implementations must check `cx` at their own checkpoints; cancellation
/// is never forced.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self, cx: JobContext) -> JobResult;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn run(&self, cx: JobContext) -> JobResult {
        (self.0)(cx).await
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between a unit and its job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    signal: Signal,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` the first time only.
    pub fn cancel(&self) -> bool {
        self.signal.fire()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_fired()
    }

    pub async fn cancelled(&self) {
        self.signal.fired().await
    }
}

/// Handed to a job when it starts.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: WorkId,
    name: Arc<str>,
    token: CancelToken,
}

impl JobContext {
    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancellation checkpoint: `cx.checkpoint()?` stops a cancelled job.
    pub fn checkpoint(&self) -> std::result::Result<(), JobError> {
        if self.token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep that wakes early with [`JobError::Cancelled`].
    pub async fn sleep(&self, duration: Duration) -> std::result::Result<(), JobError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

// ---------------------------------------------------------------------------
// Work unit
// ---------------------------------------------------------------------------

type CompletionHandler = Box<dyn FnOnce(&WorkUnit) + Send + 'static>;

#[derive(Default)]
struct Record {
    outcome: Option<Outcome>,
    transitions: Vec<Transition>,
    dependencies: Vec<WorkUnit>,
    completion: Option<CompletionHandler>,
}

struct Inner {
    id: WorkId,
    name: Arc<str>,
    job: Arc<dyn Job>,
    token: CancelToken,
    state: watch::Sender<State>,
    record: Mutex<Record>,
}

/// A schedulable, cancellable unit of asynchronous work.
///
/// Cheap to clone; clones refer to the same unit.
#[derive(Clone)]
pub struct WorkUnit {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkUnit {
    pub fn new(name: impl Into<String>, job: impl Job) -> Self {
        let (state, _) = watch::channel(State::Created);
        let name: String = name.into();
        Self {
            inner: Arc::new(Inner {
                id: WorkId::new(),
                name: Arc::from(name),
                job: Arc::new(job),
                token: CancelToken::new(),
                state,
                record: Mutex::new(Record::default()),
            }),
        }
    }

    /// Build a unit from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::new(name, FnJob(f))
    }

    pub fn id(&self) -> WorkId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// True once the unit has finished in the `cancelled` state.
    pub fn is_cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }

    /// True once cancellation was requested, whatever the state.
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.record.lock().outcome.clone()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.record.lock().transitions.clone()
    }

    /// Sequence number of the transition into `state`, if it happened.
    pub fn seq_of(&self, state: State) -> Option<u64> {
        self.inner
            .record
            .lock()
            .transitions
            .iter()
            .find(|t| t.to == state)
            .map(|t| t.seq)
    }

    /// Request cooperative cancellation.
    ///
    /// No-op on a terminal unit. Returns `true` if this call set the flag.
    pub fn cancel(&self) -> bool {
        let mut first = false;
        // Holding the state lock keeps a concurrent terminal transition out.
        self.inner.state.send_if_modified(|state| {
            if !state.is_terminal() {
                first = self.inner.token.cancel();
            }
            false
        });
        if first {
            debug!(id = %self.id(), name = %self.name(), state = %self.state(), "cancel requested");
            metrics::unit_cancellations().add(1, &[]);
        }
        first
    }

    /// Make this unit wait for `other` to finish before it starts.
    pub fn add_dependency(&self, other: &WorkUnit) -> Result<()> {
        if other.id() == self.id() {
            return Err(Error::Other(format!(
                "work unit {} cannot depend on itself",
                self.id()
            )));
        }
        let state = self.state();
        if state != State::Created {
            return Err(Error::AlreadySubmitted {
                id: self.id(),
                state,
            });
        }
        self.inner.record.lock().dependencies.push(other.clone());
        Ok(())
    }

    pub fn dependencies(&self) -> Vec<WorkUnit> {
        self.inner.record.lock().dependencies.clone()
    }

    /// Set a handler run once, on a queue worker, after the unit finishes.
    /// Runs for every terminal state, cancellation included.
    pub fn set_completion_handler(&self, handler: impl FnOnce(&WorkUnit) + Send + 'static) {
        self.inner.record.lock().completion = Some(Box::new(handler));
    }

    /// Wait until the unit reaches a terminal state.
    pub async fn finished(&self) -> State {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.state(),
        }
    }

    // -- queue-facing lifecycle ---------------------------------------------

    pub(crate) fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    pub(crate) fn job(&self) -> Arc<dyn Job> {
        Arc::clone(&self.inner.job)
    }

    pub(crate) fn context(&self) -> JobContext {
        JobContext {
            id: self.inner.id,
            name: Arc::clone(&self.inner.name),
            token: self.inner.token.clone(),
        }
    }

    /// Accept the unit into a queue.
    pub(crate) fn mark_ready(&self) -> Result<()> {
        let state = self.state();
        if state != State::Created {
            return Err(Error::AlreadySubmitted {
                id: self.id(),
                state,
            });
        }
        self.transition(State::Ready, None)
    }

    /// Start executing, or finish as cancelled if cancellation was
    /// requested first. Returns the state the unit moved to.
    pub(crate) fn begin(&self) -> Result<State> {
        // Decided under the state lock, which `cancel` also holds.
        self.transition_with(|| {
            if self.inner.token.is_cancelled() {
                (State::Cancelled, Some(Outcome::cancelled(0)))
            } else {
                (State::Executing, None)
            }
        })
    }

    /// Every dependency has finished.
    pub(crate) fn dependencies_ready(&self) -> bool {
        self.inner
            .record
            .lock()
            .dependencies
            .iter()
            .all(WorkUnit::is_finished)
    }

    pub(crate) async fn dependencies_finished(&self) {
        for dependency in self.dependencies() {
            dependency.finished().await;
        }
    }

    /// Record the job's result and move to the matching terminal state.
    pub(crate) fn finish(&self, result: JobResult, duration_ms: u64) -> Result<State> {
        let (to, outcome) = match result {
            Ok(data) => (
                State::Completed,
                Outcome {
                    success: true,
                    data,
                    error: None,
                    duration_ms,
                },
            ),
            Err(JobError::Cancelled) => (State::Cancelled, Outcome::cancelled(duration_ms)),
            Err(JobError::Failed(error)) => (
                State::Failed,
                Outcome {
                    success: false,
                    data: None,
                    error: Some(error),
                    duration_ms,
                },
            ),
        };
        self.transition(to, Some(outcome))?;
        Ok(to)
    }

    /// Finish a unit that was cancelled before it started.
    pub(crate) fn finish_cancelled(&self) -> Result<()> {
        self.transition(State::Cancelled, Some(Outcome::cancelled(0)))
    }

    /// Run the completion handler, if any. A panicking handler is logged
    /// and otherwise ignored.
    pub(crate) fn run_completion_handler(&self) {
        let handler = self.inner.record.lock().completion.take();
        let Some(handler) = handler else {
            return;
        };
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(self))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(id = %self.id(), name = %self.name(), %message, "completion handler panicked");
        }
    }

    fn transition(&self, to: State, outcome: Option<Outcome>) -> Result<()> {
        self.transition_with(move || (to, outcome)).map(|_| ())
    }

    fn transition_with(
        &self,
        decide: impl FnOnce() -> (State, Option<Outcome>),
    ) -> Result<State> {
        let mut rejected = None;
        let mut from = State::Created;
        let mut to = State::Created;
        self.inner.state.send_if_modified(|state| {
            let (target, outcome) = decide();
            to = target;
            if !state.can_transition_to(to) {
                rejected = Some(*state);
                return false;
            }
            from = *state;
            // Outcome and history land before waiters observe the new state.
            let mut record = self.inner.record.lock();
            if let Some(outcome) = outcome {
                record.outcome = Some(outcome);
            }
            record.transitions.push(Transition::record(*state, to));
            *state = to;
            true
        });

        if let Some(from) = rejected {
            return Err(Error::InvalidTransition { from, to });
        }

        debug!(id = %self.id(), name = %self.name(), %from, %to, "state transition");
        metrics::unit_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        Ok(to)
    }
}
